//! A scripted stand-in for the transport executable. The "device" is the host:
//! `shell` runs through `sh -c`, `pull`/`push` copy local paths.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use crate::app::adb::transport::Transport;

pub struct FakeTransport {
    devices: Vec<(String, String)>,
    props: Vec<(String, Option<String>)>,
    shell_cases: Vec<(String, String)>,
    pull_body: String,
    push_body: String,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            props: Vec::new(),
            shell_cases: Vec::new(),
            pull_body: r#"exec cp -R "$1" "$2""#.to_string(),
            push_body: r#"exec cp -R "$1" "$2""#.to_string(),
        }
    }

    pub fn device(mut self, serial: &str, status: &str) -> Self {
        self.devices.push((serial.to_string(), status.to_string()));
        self
    }

    pub fn prop(mut self, key: &str, value: &str) -> Self {
        self.props.push((key.to_string(), Some(value.to_string())));
        self
    }

    /// `getprop <key>` exits non-zero.
    pub fn failing_prop(mut self, key: &str) -> Self {
        self.props.push((key.to_string(), None));
        self
    }

    /// Handles shell commands matching `pattern` (a `case` glob) with `body`.
    /// The full command string is in `$1`; the body must `exit` or `exec`.
    pub fn shell_case(mut self, pattern: &str, body: &str) -> Self {
        self.shell_cases
            .push((pattern.to_string(), body.to_string()));
        self
    }

    pub fn pull_body(mut self, body: &str) -> Self {
        self.pull_body = body.to_string();
        self
    }

    pub fn push_body(mut self, body: &str) -> Self {
        self.push_body = body.to_string();
        self
    }

    fn script(&self) -> String {
        let mut devices = String::new();
        for (serial, status) in &self.devices {
            let _ = writeln!(devices, "    printf '%s\\t%s\\n' '{serial}' '{status}'");
        }
        let mut props = String::new();
        for (key, value) in &self.props {
            match value {
                Some(value) => {
                    let _ = writeln!(props, "          '{key}') echo '{value}'; exit 0 ;;");
                }
                None => {
                    let _ = writeln!(
                        props,
                        "          '{key}') echo 'getprop: failed' >&2; exit 1 ;;"
                    );
                }
            }
        }
        let mut shell_cases = String::new();
        for (pattern, body) in &self.shell_cases {
            let _ = writeln!(shell_cases, "      {pattern})\n        {body}\n        ;;");
        }
        format!(
            r#"#!/bin/sh
if [ "$1" = "-s" ]; then
  shift 2
fi
cmd="$1"
shift
case "$cmd" in
  devices)
    printf 'List of devices attached\n'
{devices}    printf '\n'
    exit 0
    ;;
  shell)
    case "$1" in
      "getprop "*)
        key="${{1#getprop }}"
        case "$key" in
{props}          *) exit 0 ;;
        esac
        ;;
{shell_cases}    esac
    exec sh -c "$*"
    ;;
  pull)
    {pull}
    ;;
  push)
    {push}
    ;;
esac
echo "unknown command: $cmd" >&2
exit 1
"#,
            pull = self.pull_body,
            push = self.push_body,
        )
    }

    /// Writes the script into a fresh temp dir. Keep the `TempDir` alive for the test.
    pub fn install(self) -> (TempDir, Transport) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path: PathBuf = dir.path().join("fake-adb.sh");
        fs::write(&path, self.script()).expect("write fake transport");
        let transport =
            Transport::new("sh").with_global_args(vec![path.to_string_lossy().to_string()]);
        (dir, transport)
    }
}
