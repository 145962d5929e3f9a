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

use crate::storage::StorageConfig;
use config::{Config, ConfigError, Environment, File, FileFormat, Map};
use serde::Deserialize;
use std::error::Error;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "NETBRIDGE";

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Server {
    pub listen_addr: String,
    pub port: u16,
    pub upload_limit: u64,
    pub log_level: u8,
    pub log_file: String,

    // directory /file may read from in local storage mode. empty disables
    pub file_root: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen_addr: String::from("127.0.0.1"),
            port: 8080,
            upload_limit: 0,
            log_level: 2,
            log_file: String::new(),
            file_root: String::new(),
        }
    }
}

impl Server {
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let ip: IpAddr = self.listen_addr.parse()?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

impl From<Server> for config::ValueKind {
    fn from(server: Server) -> Self {
        let mut properties = std::collections::HashMap::new();
        properties.insert(
            "listen_addr".to_string(),
            config::Value::from(server.listen_addr),
        );
        properties.insert("port".to_string(), config::Value::from(server.port));
        properties.insert(
            "upload_limit".to_string(),
            config::Value::from(server.upload_limit),
        );
        properties.insert(
            "log_level".to_string(),
            config::Value::from(server.log_level),
        );
        properties.insert(
            "log_file".to_string(),
            config::Value::from(server.log_file),
        );
        properties.insert(
            "file_root".to_string(),
            config::Value::from(server.file_root),
        );

        Self::Table(properties)
    }
}

impl From<StorageConfig> for config::ValueKind {
    fn from(storage: StorageConfig) -> Self {
        let mut properties = std::collections::HashMap::new();
        properties.insert(
            "serverid".to_string(),
            config::Value::from(storage.server_id),
        );
        properties.insert("apikey".to_string(), config::Value::from(storage.api_key));
        properties.insert(
            "rootpath".to_string(),
            config::Value::from(storage.root_path),
        );
        properties.insert("port".to_string(), config::Value::from(storage.port));

        // unset means local file mode
        if let Some(domain) = storage.domain {
            properties.insert("domain".to_string(), config::Value::from(domain));
        }

        if let Some(session_id) = storage.session_id {
            properties.insert("sessionid".to_string(), config::Value::from(session_id));
        }

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub storage: StorageConfig,
}

impl Settings {
    /// Loads settings from defaults, then the INI file if any, then
    /// `NETBRIDGE_<SECTION>__<KEY>` environment variables.
    pub fn new(config_file: Option<&Path>) -> Result<Settings, ConfigError> {
        Self::load(config_file, None)
    }

    // env_vars replaces the process environment when set
    fn load(
        config_file: Option<&Path>,
        env_vars: Option<Map<String, String>>,
    ) -> Result<Settings, ConfigError> {
        let mut builder = Config::builder()
            .set_default("server", Server::default())?
            .set_default("storage", StorageConfig::default())?;

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).format(FileFormat::Ini));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env_vars),
            )
            .build()?;

        config.try_deserialize()
    }
}

/// Parses a `[addr:]port` listen argument. Without an address, the
/// current one is kept.
pub fn parse_listen_arg(arg: &str, server: &mut Server) -> Result<(), Box<dyn Error>> {
    let (addr, port) = match arg.rfind(':') {
        Some(pos) => (Some(&arg[..pos]), &arg[(pos + 1)..]),
        None => (None, arg),
    };

    let port: u16 = port
        .parse()
        .map_err(|e| format!("invalid port in {:?}: {}", arg, e))?;

    if let Some(addr) = addr {
        let addr = addr.trim_start_matches('[').trim_end_matches(']');

        addr.parse::<IpAddr>()
            .map_err(|e| format!("invalid address in {:?}: {}", arg, e))?;

        server.listen_addr = addr.to_string();
    }

    server.port = port;

    Ok(())
}

/// Picks the config file: the one given on the command line, which must
/// exist, else the first default location that does. No file at all is
/// fine.
pub fn get_config_file(
    work_dir: &Path,
    arg_config: Option<PathBuf>,
) -> Result<Option<PathBuf>, Box<dyn Error>> {
    if let Some(path) = arg_config {
        return match path.try_exists() {
            Ok(true) => Ok(Some(path)),
            Ok(false) => Err(format!("failed to open {}", path.display()).into()),
            Err(e) => {
                Err(format!("failed to open {}, with error: {:?}", path.display(), e).into())
            }
        };
    }

    let candidates = [
        // ./config
        work_dir.join("config").join("netbridge.conf"),
        work_dir.join("netbridge.conf"),
    ];

    Ok(candidates.iter().find(|p| p.is_file()).cloned())
}
