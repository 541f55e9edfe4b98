use std::io::Write;

use chrono::Utc;
use log::info;

fn builder(default_filter: &str) -> env_logger::Builder {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let mut builder = env_logger::Builder::from_env(env);
    builder.format(|buf, record| {
        let level_style = buf.default_level_style(record.level());
        writeln!(
            buf,
            "[{} {} {}:{}] {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            level_style.value(record.level()),
            record.file().unwrap_or("<unnamed>"),
            record.line().unwrap_or(0),
            &record.args()
        )
    });
    builder
}

/// Initialize the global logger. `RUST_LOG` overrides the default `debug` filter.
pub fn init_log() {
    builder("debug").init();
    info!("env_logger initialized");
}

/// Same format as [`init_log`], but safe to call from every test.
pub fn init_test_log() {
    let _ = builder("trace").is_test(true).try_init();
}
