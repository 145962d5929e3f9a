/*
 * Copyright (C) 2024 Fastly, Inc.
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
 */

use clap::{ArgAction, Parser};
use log::{error, info};
use netbridge::app;
use netbridge::config::{get_config_file, parse_listen_arg, Settings};
use netbridge::core::log::{
    ensure_init_simple_logger, get_simple_logger, level_filter, local_offset_check, open_log_file,
};
use std::convert::TryFrom;
use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(
    name = "netbridge",
    version,
    about = "Embedded HTTP server with a cross-thread event bridge."
)]
pub struct CliArgs {
    #[arg(long, value_name = "file", help = "Config file.")]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "file", help = "File to log to.")]
    pub logfile: Option<PathBuf>,

    #[arg(long, value_name = "x", help = "Log level 0-4 (default: 2).")]
    pub loglevel: Option<u8>,

    #[arg(long, action=ArgAction::SetTrue, help = "Verbose output. Same as --loglevel=3.")]
    pub verbose: bool,

    #[arg(long, value_name = "[addr:]port", help = "Address and port to listen on.")]
    pub listen: Option<String>,

    #[arg(
        long,
        value_name = "bytes",
        help = "Largest request body to accept (0 = unlimited)."
    )]
    pub upload_limit: Option<u64>,
}

fn process_args_and_run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    let config_file = get_config_file(&env::current_dir()?, args.config)?;
    let mut settings = Settings::new(config_file.as_deref())?;

    if let Some(listen) = &args.listen {
        parse_listen_arg(listen, &mut settings.server)?;
    }

    if let Some(limit) = args.upload_limit {
        settings.server.upload_limit = limit;
    }

    let log_path = match args.logfile {
        Some(x) => Some(x),
        None if !settings.server.log_file.is_empty() => {
            Some(PathBuf::from(&settings.server.log_file))
        }
        None => None,
    };

    let log_file = match log_path {
        Some(x) => match open_log_file(&x) {
            Ok(x) => Some(x),
            Err(_) => {
                error!("unable to open log file. logging to standard out.");
                None
            }
        },
        None => None,
    };

    ensure_init_simple_logger(log_file);
    log::set_logger(get_simple_logger())?;

    let level = if args.verbose {
        3
    } else {
        args.loglevel.unwrap_or(settings.server.log_level)
    };

    log::set_max_level(level_filter(level));

    local_offset_check();

    if let Some(f) = &config_file {
        info!("using config: {:?}", f.display());
    }

    let config = app::Config {
        listen_addr: settings.server.listen_socket_addr()?,
        upload_limit: usize::try_from(settings.server.upload_limit)?,
        storage: settings.storage,
        file_root: if settings.server.file_root.is_empty() {
            None
        } else {
            Some(PathBuf::from(&settings.server.file_root))
        },
    };

    netbridge::run(&config)
}

fn main() {
    let args = CliArgs::parse();

    if let Err(e) = process_args_and_run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
