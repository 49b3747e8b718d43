use log::info;

/// Smallest size difference treated as meaningful anywhere in the crate.
/// Sizes are quantized to 4 decimals before hitting an exchange, so this is
/// well below the finest representable slice.
pub const SIZE_EPSILON: f64 = 1e-6;

/// Decimal places used when quantizing order sizes before submission.
pub const SIZE_DECIMALS: u32 = 4;

pub fn setup_logging(level: log::LevelFilter) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("rusqlite", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()?;
    info!("Logging initialized.");
    Ok(())
}

/// Quantize an order size to the fixed submission precision.
pub fn round_size(size: f64) -> f64 {
    let scale = 10f64.powi(SIZE_DECIMALS as i32);
    (size * scale).round() / scale
}
