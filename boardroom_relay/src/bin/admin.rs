// Line-oriented admin console.
//
// Logs in to a server's admin port, then sends each stdin line as one
// command and prints every reply as it arrives (replies to other consoles'
// commands included). Exits on EOF or when the server closes the connection.

use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::thread;

use boardroom_relay::admin::AdminClient;
use boardroom_relay::client::ClientError;
use boardroom_relay::config::{ADMIN_PASSWORD_ENV, ClientConfig};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "boardroom-admin", version, about = "Boardroom admin console")]
struct Cli {
    /// Admin address of the server
    #[arg(long, default_value = "127.0.0.1:7879")]
    addr: SocketAddr,

    /// Admin shared secret
    #[arg(long, env = ADMIN_PASSWORD_ENV)]
    password: String,
}

fn main() {
    let cli = Cli::parse();
    let mut client = match AdminClient::connect(cli.addr, &cli.password, &ClientConfig::default()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Login failed: {e}");
            std::process::exit(1);
        }
    };
    let mut replies = match client.try_clone() {
        Ok(reader) => reader,
        Err(e) => {
            eprintln!("Failed to clone connection: {e}");
            std::process::exit(1);
        }
    };
    println!("Connected to {}. Type -help for commands.", cli.addr);

    thread::spawn(move || {
        loop {
            match replies.recv(None) {
                Ok(Some(reply)) => println!("{reply}"),
                Ok(None) => {}
                Err(ClientError::Closed) => {
                    println!("Server closed the connection.");
                    std::process::exit(0);
                }
                Err(e) => {
                    eprintln!("Connection error: {e}");
                    std::process::exit(1);
                }
            }
        }
    });

    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                eprintln!("Failed to read stdin: {e}");
                std::process::exit(1);
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = client.send(line.trim()) {
            eprintln!("Failed to send: {e}");
            std::process::exit(1);
        }
    }
}
