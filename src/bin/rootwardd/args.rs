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

//! Implements command-line argument parsing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::anyhow;
use clap::{Parser, Subcommand};

use rootward::name::Name;

/// Parses the command line arguments.
pub fn parse() -> Args {
    Args::parse()
}

/// The Rootward recursive DNS server
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server
    Run(RunArgs),
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Set the configuration file to use
    #[clap(long, conflicts_with_all = &["bind", "ip", "port"], value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Set the server bind IP address and port
    #[clap(long, value_name = "IP:PORT")]
    pub bind: Option<SocketAddr>,

    /// Set the server bind IP address
    #[clap(long, conflicts_with = "bind", value_name = "IP")]
    pub ip: Option<IpAddr>,

    /// Set the server port
    #[clap(long, conflicts_with = "bind", value_name = "PORT")]
    pub port: Option<u16>,

    /// Add name->address overrides
    #[clap(
        long = "override",
        value_delimiter = ',',
        value_name = "NAME=ADDR",
        value_parser
    )]
    pub overrides: Vec<OverrideDescription>,
}

/// An override provided on the command line with the `--override`
/// option, parsed with its [`FromStr`] implementation from the form
/// `printer.lan.=10.0.0.9`.
#[derive(Clone, Debug)]
pub struct OverrideDescription {
    pub name: Name,
    pub address: Ipv4Addr,
}

impl FromStr for OverrideDescription {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, address) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("an override must have the form NAME=ADDR"))?;
        Ok(Self {
            name: name
                .parse()
                .map_err(|e| anyhow!("invalid override name: {}", e))?,
            address: address
                .parse()
                .map_err(|e| anyhow!("invalid override address: {}", e))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_description_from_str_works() {
        let description: OverrideDescription = "printer.lan.=10.0.0.9".parse().unwrap();
        assert_eq!(description.name, "printer.lan.".parse().unwrap());
        assert_eq!(description.address, Ipv4Addr::new(10, 0, 0, 9));
    }

    #[test]
    fn override_description_from_str_rejects_bad_forms() {
        assert!("printer.lan.".parse::<OverrideDescription>().is_err());
        assert!("=10.0.0.9".parse::<OverrideDescription>().is_err());
        assert!("printer.lan.=not-an-address"
            .parse::<OverrideDescription>()
            .is_err());
    }
}
