/// Partial likelihood vectors whose largest entry falls below this threshold
/// are multiplied by its reciprocal and the event is recorded in the
/// per-pattern scale counter.
pub const SCALING_THRESHOLD: f64 = 1e-150;

pub const SCALING_THRESHOLD_INVER: f64 = 1e150;

/// ln(SCALING_THRESHOLD)
pub const LOG_SCALING_THRESHOLD: f64 = -345.387_763_949_106_84;

/// Branch lengths shorter than this are treated as zero by the model layer.
pub const MIN_BRANCH_LENGTH: f64 = 1e-10;
