pub mod logging;
pub mod paths;
pub mod units;
