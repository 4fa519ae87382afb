// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Implements the server configuration file.

use std::fmt::{self, Write};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::Level::Debug;
use log::{debug, log_enabled};
use paste::paste;
use serde::{de, Deserialize};

use rootward::io::BlockingIoConfig;
use rootward::name::Name;
use rootward::server::OverrideTable;

use crate::args::RunArgs;

////////////////////////////////////////////////////////////////////////
// CONFIGURATION LOADING                                              //
////////////////////////////////////////////////////////////////////////

/// Loads the server configuration from the file given by `path`.
///
/// The `reloading` parameter controls how the configuration is
/// summarized in the log: if reloading, only the override table (the
/// only thing that we support reloading) is summarized. This parameter
/// does *not* otherwise affect processing.
pub fn load_from_path(path: impl AsRef<Path>, reloading: bool) -> Result<Config> {
    let raw_config = fs::read(path.as_ref()).context("failed to read the configuration file")?;
    let config: Config =
        toml::from_slice(&raw_config).context("failed to parse the configuration file")?;
    if reloading {
        log_override_summary(&config.overrides);
    } else {
        log_config_summary(&config);
    }
    Ok(config)
}

/// Loads the server configuration from the parsed command line
/// arguments given by `args`.
pub fn load_from_args(args: RunArgs) -> Config {
    let bind = args.bind.unwrap_or_else(|| {
        let ip = args.ip.unwrap_or(DEFAULT_BIND_IP);
        let port = args.port.unwrap_or(DEFAULT_BIND_PORT);
        SocketAddr::new(ip, port)
    });

    let config = Config {
        bind,
        io: IoConfig::default(),
        resolver: ResolverConfig::default(),
        overrides: args
            .overrides
            .into_iter()
            .map(|od| OverrideConfig {
                name: ConfigName(od.name),
                address: od.address,
            })
            .collect(),
    };
    log_config_summary(&config);
    config
}

/// Builds the override table shared by all workers.
pub fn make_override_table(overrides: &[OverrideConfig]) -> Result<Arc<OverrideTable>> {
    let mut table = OverrideTable::new();
    for override_config in overrides {
        let name = override_config.name.0.clone();
        if table.insert(name, override_config.address).is_some() {
            return Err(anyhow!(
                "duplicate override for {}",
                override_config.name.0
            ));
        }
    }
    Ok(Arc::new(table))
}

/// Summarizes the configuration in the log, if the debug log level is
/// enabled.
fn log_config_summary(config: &Config) {
    if !log_enabled!(Debug) {
        // Don't compute the message if it will never be printed.
        return;
    }

    let mut message = format!(
        "Configuration loaded:\n\
         Bind address:     {}\n\
         TCP workers:      {}\n\
         UDP workers:      {}\n\
         Upstream timeout: {} s\n\
         Overrides:        ",
        config.bind,
        config.io.tcp_workers,
        config.io.udp_workers,
        config.resolver.upstream_timeout,
    );
    summarize_overrides(&config.overrides, &mut message);
    debug!("{}", message);
}

/// Summarizes only the override table in the log, if the debug log
/// level is enabled. Used when reloading.
fn log_override_summary(overrides: &[OverrideConfig]) {
    if log_enabled!(Debug) {
        let mut message = String::from("Override table reloaded:\nOverrides: ");
        summarize_overrides(overrides, &mut message);
        debug!("{}", message);
    }
}

fn summarize_overrides(overrides: &[OverrideConfig], message: &mut String) {
    if overrides.is_empty() {
        message.push_str("none");
    } else {
        write!(message, "{}", overrides.len()).unwrap();
        for override_config in overrides {
            write!(
                message,
                "\n  {} -> {}",
                override_config.name.0, override_config.address,
            )
            .unwrap();
        }
    }
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION FILE STRUCTURE                                       //
////////////////////////////////////////////////////////////////////////

/// The complete configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default, rename = "override")]
    pub overrides: Vec<OverrideConfig>,
}

const DEFAULT_BIND_IP: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);
const DEFAULT_BIND_PORT: u16 = 53;

fn default_bind() -> SocketAddr {
    SocketAddr::new(DEFAULT_BIND_IP, DEFAULT_BIND_PORT)
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: I/O                                         //
////////////////////////////////////////////////////////////////////////

/// The `[io]` section: worker thread counts for the blocking I/O
/// provider.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoConfig {
    #[serde(default = "default_tcp_workers")]
    pub tcp_workers: usize,
    #[serde(default = "default_udp_workers")]
    pub udp_workers: usize,
}

fn default_tcp_workers() -> usize {
    4
}

fn default_udp_workers() -> usize {
    2
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            tcp_workers: default_tcp_workers(),
            udp_workers: default_udp_workers(),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: RESOLVER                                    //
////////////////////////////////////////////////////////////////////////

/// The `[resolver]` section.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    /// The timeout for each upstream exchange, in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
}

fn default_upstream_timeout() -> u64 {
    rootward::resolver::transport::DEFAULT_TIMEOUT.as_secs()
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: default_upstream_timeout(),
        }
    }
}

/// Combines the `[io]` and `[resolver]` sections into the blocking
/// provider's configuration.
pub fn make_io_config(config: &Config) -> BlockingIoConfig {
    BlockingIoConfig {
        tcp_workers_per_listener: config.io.tcp_workers,
        udp_workers_per_socket: config.io.udp_workers,
        upstream_timeout: Duration::from_secs(config.resolver.upstream_timeout),
    }
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: OVERRIDES                                   //
////////////////////////////////////////////////////////////////////////

/// A single `[[override]]` entry.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverrideConfig {
    pub name: ConfigName,
    pub address: Ipv4Addr,
}

////////////////////////////////////////////////////////////////////////
// WRAPPERS OVER ROOTWARD TYPES FOR SERDE                             //
////////////////////////////////////////////////////////////////////////

/// Generates a deserializable `ConfigX` structure wrapping an `X` type
/// from [`rootward`], using its [`FromStr`](std::str::FromStr)
/// implementation.
macro_rules! make_serde_wrapper {
    ($wrapper:ident, $over:ty, $description:literal) => {
        /// A macro-generated deserializable wrapper over a [`rootward`]
        /// type.
        #[derive(Clone, Debug)]
        pub struct $wrapper(pub $over);

        impl<'de> Deserialize<'de> for $wrapper {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: de::Deserializer<'de>,
            {
                deserializer.deserialize_str(paste! { [<$wrapper Visitor>] })
            }
        }

        paste! {
            /// A macro-generated [`Visitor`](de::Visitor).
            #[derive(Debug)]
            struct [<$wrapper Visitor>];
        }

        impl<'de> de::Visitor<'de> for paste! { [<$wrapper Visitor>] } {
            type Value = $wrapper;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str($description)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value
                    .parse()
                    .map($wrapper)
                    .map_err(|e| E::custom(format!("invalid {}: {}", $description, e)))
            }
        }
    };
}

make_serde_wrapper!(ConfigName, Name, "domain name");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_configuration_parses() {
        let config: Config = toml::from_str(
            r#"
            bind = "0.0.0.0:53"

            [io]
            tcp_workers = 8
            udp_workers = 4

            [resolver]
            upstream_timeout = 3

            [[override]]
            name = "printer.lan."
            address = "10.0.0.9"

            [[override]]
            name = "nas.lan."
            address = "10.0.0.10"
            "#,
        )
        .unwrap();
        assert_eq!(config.bind, "0.0.0.0:53".parse().unwrap());
        assert_eq!(config.io.tcp_workers, 8);
        assert_eq!(config.io.udp_workers, 4);
        assert_eq!(config.resolver.upstream_timeout, 3);
        assert_eq!(config.overrides.len(), 2);

        let table = make_override_table(&config.overrides).unwrap();
        assert_eq!(
            table.get(&"printer.lan.".parse().unwrap()),
            Some(&Ipv4Addr::new(10, 0, 0, 9))
        );
    }

    #[test]
    fn defaults_apply_to_an_empty_configuration() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.bind, default_bind());
        assert_eq!(config.io.tcp_workers, default_tcp_workers());
        assert_eq!(config.overrides.len(), 0);
    }

    #[test]
    fn duplicate_overrides_are_rejected() {
        let config: Config = toml::from_str(
            r#"
            [[override]]
            name = "printer.lan."
            address = "10.0.0.9"

            [[override]]
            name = "printer.lan"
            address = "10.0.0.10"
            "#,
        )
        .unwrap();
        assert!(make_override_table(&config.overrides).is_err());
    }
}
