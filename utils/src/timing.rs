// Helpers to handle budgeting subsystems based on time
//
// Austin Shafer - 2020
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn get_current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Error getting system time")
}

// Helper to get the current time in milliseconds
#[allow(dead_code)]
pub fn get_current_millis() -> u32 {
    get_current_time().as_millis() as u32
}
