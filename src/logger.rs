use crate::config::Config;

/// Initialize the process-wide logger from the configuration.
pub fn init(config: &Config) -> anyhow::Result<()> {
    simple_logger::init_with_level(config.log.level.as_level())?;
    Ok(())
}
