pub mod locator;
pub mod parse;
pub mod paths;
pub mod runner;
pub mod transport;
