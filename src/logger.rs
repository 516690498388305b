/*
 * Copyright (c) 2023 University of Oxford.
 * Copyright (c) 2023 Red Hat, Inc.
 * All rights reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use crate::errors::{LoggerError, LoggerResult};
use log::{LevelFilter, Metadata, Record};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

/// Writes `<elapsed> <level> - <message>` lines. The elapsed time counts from
/// logger setup, which makes the freeze window of a migration readable
/// directly from the log.
pub struct Logger {
    level: LevelFilter,
    started: Instant,
    log_file: Option<Mutex<File>>,
}

impl Logger {
    pub fn new(level: LevelFilter) -> Box<Self> {
        Box::new(Self { level, started: Instant::now(), log_file: None })
    }

    /// `-` selects stdout. Missing parent directories are created.
    pub fn set_log_file(&mut self, path: &Path) -> LoggerResult<()> {
        if path.to_string_lossy() == "-" {
            self.log_file = None;
            return Ok(());
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(LoggerError::IoError)?;

        self.log_file = Some(Mutex::new(file));
        Ok(())
    }

    fn write_log(&self, record: &Record) -> std::io::Result<()> {
        let elapsed = self.started.elapsed().as_secs_f64();
        match &self.log_file {
            Some(file) => {
                let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                writeln!(file, "{:>10.3} {} - {}", elapsed, record.level(), record.args())
            }
            None => {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                writeln!(out, "{:>10.3} {} - {}", elapsed, record.level(), record.args())
            }
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            if let Err(error) = self.write_log(record) {
                eprintln!("Error writing to log file: {}", error);
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.log_file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

pub fn init_logger(log_file: &Path, level: LevelFilter) -> LoggerResult<()> {
    let mut main_logger = Logger::new(level);
    log_panics::init();

    main_logger.set_log_file(log_file)?;

    log::set_boxed_logger(main_logger).map_err(|e| LoggerError::LoggerInitError(e.to_string()))?;
    log::set_max_level(level);

    Ok(())
}
