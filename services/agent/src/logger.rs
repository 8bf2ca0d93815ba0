// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;

use log::debug;
use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};

use crate::cli::LogLevel;

fn logger_pattern() -> PatternEncoder {
    PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S%.3f)} - {l} - {m}{n}")
}

pub fn build_logger_config(log_file: &Path, log_level: LogLevel, include_console: bool) -> anyhow::Result<Config> {
    if let Some(dir) = log_file.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let file_appender = FileAppender::builder()
        .encoder(Box::new(logger_pattern()))
        .build(log_file)?;

    let mut config_builder = Config::builder().appender(Appender::builder().build("file", Box::new(file_appender)));
    let mut root_builder = Root::builder().appender("file");

    if include_console {
        let console_appender = ConsoleAppender::builder().encoder(Box::new(logger_pattern())).build();
        config_builder = config_builder.appender(Appender::builder().build("console", Box::new(console_appender)));
        root_builder = root_builder.appender("console");
    }

    Ok(config_builder.build(root_builder.build(log_level.to_level_filter()))?)
}

/// File logging through log4rs when a file is given, console logging through env_logger otherwise.
pub fn init_logger(log_level: LogLevel, log_file: Option<&Path>) -> anyhow::Result<()> {
    match log_file {
        Some(file) => {
            let config = build_logger_config(file, log_level, true)?;
            log4rs::init_config(config)?;
        }
        None => {
            env_logger::Builder::new()
                .filter_level(log_level.to_level_filter())
                .parse_default_env()
                .try_init()?;
        }
    }
    debug!("Logger initialized with level: {}", log_level);
    Ok(())
}
