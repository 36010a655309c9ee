/// Fleet error codes that describe a capacity or throttling condition
/// worth retrying. Anything else coming back from a bulk create is
/// treated as fatal.
pub const RETRIABLE_FLEET_ERRORS: [&str; 7] = [
    "UnfulfillableCapacity",
    "MaxSpotInstanceCountExceeded",
    "TargetCapacityLimitExceededException",
    "RequestLimitExceeded",
    "ResourceLimitExceeded",
    "MaxSpotFleetRequestCountExceeded",
    "InsufficientInstanceCapacity",
];

pub fn is_retriable_fleet_error(code: &str) -> bool {
    RETRIABLE_FLEET_ERRORS.contains(&code)
}
