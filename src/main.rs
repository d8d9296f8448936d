use clap::{Args, Parser, Subcommand};

use roomcall_lib::config::{ClientConfig, ServerConfig, SignalingConfig};
use roomcall_lib::Role;

#[derive(Parser)]
#[command(name = "roomcall", about = "Two-party video calls over WebRTC")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the rendezvous server
    Serve {
        #[arg(long, env = "PORT", default_value_t = 3000)]
        port: u16,

        #[arg(long, default_value = "/peerjs")]
        path: String,
    },
    /// Create a room and wait for someone to join
    Create {
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Join an existing room by id
    Join {
        room_id: String,

        #[command(flatten)]
        client: ClientArgs,
    },
    /// Start at the role picker
    Start {
        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long, env = "ROOMCALL_SERVER_HOST", default_value = "localhost")]
    server_host: String,

    #[arg(long, env = "ROOMCALL_SERVER_PORT", default_value_t = 3000)]
    server_port: u16,

    #[arg(long, env = "ROOMCALL_SERVER_PATH", default_value = "/peerjs")]
    server_path: String,

    /// Use wss:// for the rendezvous server
    #[arg(long, env = "ROOMCALL_SECURE")]
    secure: bool,

    /// Ask for this room id instead of a generated one
    #[arg(long)]
    room_id: Option<String>,

    /// STUN/TURN urls, comma separated
    #[arg(long, env = "ROOMCALL_STUN", value_delimiter = ',')]
    stun: Vec<String>,

    /// Camera index
    #[arg(long)]
    camera: Option<u32>,
}

impl ClientArgs {
    fn into_config(self) -> ClientConfig {
        let defaults = ClientConfig::default();
        ClientConfig {
            signaling: SignalingConfig {
                host: self.server_host,
                port: self.server_port,
                path: self.server_path,
                secure: self.secure,
                requested_id: self.room_id,
                ..Default::default()
            },
            ice_servers: if self.stun.is_empty() {
                defaults.ice_servers
            } else {
                self.stun
            },
            camera_index: self.camera,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    roomcall_lib::init_tracing();

    match Cli::parse().command {
        Command::Serve { port, path } => roomcall_lib::run_server(ServerConfig { port, path }).await,
        Command::Create { client } => roomcall_lib::run_client(client.into_config(), Role::Create).await,
        Command::Join { room_id, client } => {
            roomcall_lib::run_client(client.into_config(), Role::Join(room_id)).await
        }
        Command::Start { client } => {
            roomcall_lib::run_client(client.into_config(), Role::Undecided).await
        }
    }
}
