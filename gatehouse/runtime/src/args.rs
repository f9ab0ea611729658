use crate::{authz, gateway, log, manage};
use anyhow::Result;
use clap::Parser;

#[derive(Debug, Parser)]
#[clap(name = "gatehouse", about = "An authorizing API gateway")]
pub struct Args {
    #[clap(
        long,
        global = true,
        default_value = "gatehouse=info,warn",
        env = "GATEHOUSE_LOG"
    )]
    log_level: String,

    #[clap(long, global = true, default_value = "plain")]
    log_format: log::LogFormat,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Runs the authorization and service registry gRPC servers.
    Authz(authz::AuthzArgs),

    /// Runs the gateway, admitting requests against the authorization
    /// service.
    Gateway(gateway::GatewayArgs),

    /// Calls the management API once and prints the result as JSON.
    Manage(manage::ManageArgs),
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            command,
        } = self;

        log::init(&log_level, log_format)?;

        match command {
            Command::Authz(args) => args.run().await,
            Command::Gateway(args) => args.run().await,
            Command::Manage(args) => args.run().await,
        }
    }
}
