mod runtime;

use runtime::app;
use runtime::config::RuntimeConfig;

fn main() {
    let config = RuntimeConfig::from_env();
    if config.show_help {
        RuntimeConfig::print_help();
        return;
    }

    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    rt.block_on(app::run(config));
}
