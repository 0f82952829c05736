//! indriyad: sensor hub daemon

use indriya_hub::app::App;
use indriya_hub::config::AppConfig;

const DEFAULT_CONFIG_PATH: &str = "/etc/indriya/indriyad.toml";

fn parse_config_path() -> String {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    return path;
                }
            }
            other if !other.starts_with('-') => return other.to_string(),
            _ => {}
        }
    }
    DEFAULT_CONFIG_PATH.to_string()
}

fn main() {
    let config_path = parse_config_path();
    let config = match AppConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config {} not usable ({}), using defaults", config_path, e);
            AppConfig::defaults()
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.logging.level),
    )
    .init();

    log::info!("starting indriyad (config: {})", config_path);
    if let Err(e) = App::new(config).run() {
        log::error!("daemon failed: {}", e);
        std::process::exit(1);
    }
}
