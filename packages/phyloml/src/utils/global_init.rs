use env_logger::Env;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

pub fn setup_logger(filter_level: LevelFilter) {
  env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
    .filter_level(filter_level)
    .format(|buf, record| {
      let mut level_str = record.level().to_string();
      level_str.truncate(1);
      let file_line = match (record.file(), record.line()) {
        (Some(file), Some(line)) => format!("{file}:{line}:"),
        (Some(file), None) => format!("{file}:"),
        _ => String::new(),
      };
      writeln!(buf, "[{level_str}] {file_line} {}", record.args())
    })
    .try_init()
    .ok();
}

pub fn global_init() {
  INIT.call_once(|| {
    color_eyre::install().ok();
    setup_logger(LevelFilter::Warn);
  });
}
