use clap::Subcommand;

use authd_daemon::Daemon;
use authd_protocol::client::Client;

use crate::errors::{CliError, Result};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage users known to authd
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum UserCommands {
    /// Allow a user to authenticate again
    Enable {
        /// Name of the user
        name: String,
    },
    /// Refuse authentication for a user
    Disable {
        /// Name of the user
        name: String,
    },
}

pub async fn dispatch(command: Commands) -> Result<()> {
    let socket_path = Daemon::socket_path();
    let mut client = Client::connect(&socket_path)
        .await
        .map_err(|_| CliError::DaemonNotRunning(socket_path.clone()))?;

    match command {
        Commands::User { command } => match command {
            UserCommands::Enable { name } => {
                client.enable_user(&name).await?;
                println!("User {name} enabled");
            }
            UserCommands::Disable { name } => {
                client.disable_user(&name).await?;
                println!("User {name} disabled");
            }
        },
    }

    Ok(())
}
