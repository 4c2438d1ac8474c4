//! lockwirectl — control utility for a running lockwire daemon

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use clap::{Parser, Subcommand};

use lockwire::control;
use lockwire::keys;

#[derive(Parser)]
#[command(name = "lockwirectl", version, about = "Lockwire control utility")]
struct Cli {
    /// Tunnel interface name
    #[arg(short, long, default_value = "wg0")]
    interface: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the live tunnel session
    Status,
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Status => cmd_status(&cli.interface),
    }
}

fn cmd_status(iface: &str) {
    let path = control::socket_path(iface);
    let mut stream = UnixStream::connect(&path).unwrap_or_else(|e| {
        eprintln!("Error: no lockwire daemon on {} ({}: {})", iface, path.display(), e);
        eprintln!("Start it with: sudo lockwire --interface {}", iface);
        std::process::exit(1);
    });

    stream.write_all(b"get=1\n").unwrap_or_else(|e| {
        eprintln!("Error talking to control socket: {}", e);
        std::process::exit(1);
    });
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap_or_else(|e| {
        eprintln!("Error reading control socket: {}", e);
        std::process::exit(1);
    });

    println!("interface: {}", iface);
    for line in response.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "listen_port" => println!("  listen port: {}", value),
            // keys travel as hex on the socket, display them as base64
            "public_key" => match keys::hex_to_base64(value) {
                Ok(b64) => println!("  peer: {}", b64),
                Err(_) => println!("  peer: {}", value),
            },
            "endpoint" => println!("  endpoint: {}", value),
            "allowed_ip" => println!("  allowed ip: {}", value),
            "errno" if value != "0" => {
                eprintln!("Device returned errno {}", value);
                std::process::exit(1);
            }
            // private_key stays private
            _ => {}
        }
    }
}
