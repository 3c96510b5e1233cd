use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use ubus::ipc::{Client, Config};

#[derive(Parser)]
#[clap(name = "ubus", about = "ubus command-line client")]
struct Opts {
    #[clap(short = 's', long = "path", default_value = "/var/tmp/ubus.sock")]
    path: String,
    #[clap(short = 't', long = "timeout", default_value = "15", help = "Reply wait, seconds")]
    timeout: f64,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[clap(about = "Call a method on a peer-owned object")]
    Call {
        object: String,
        func: String,
        #[clap(default_value = "{}", help = "JSON object with call params")]
        data: String,
    },
    #[clap(about = "Subscribe to an event and print notifications")]
    Listen { event: String },
    #[clap(about = "Publish an event")]
    Send {
        event: String,
        #[clap(default_value = "{}", help = "JSON object with event data")]
        data: String,
    },
}

fn parse_data(s: &str) -> Value {
    match serde_json::from_str(s) {
        Ok(v) => v,
        Err(e) => abort(format!("invalid JSON: {}", e)),
    }
}

fn abort(message: impl AsRef<str>) -> ! {
    eprintln!("{}", message.as_ref().red());
    std::process::exit(1)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let opts: Opts = Opts::parse();
    let config = Config::new(&opts.path).timeout(Duration::from_secs_f64(opts.timeout));
    let client = match Client::connect(&config).await {
        Ok(client) => client,
        Err(e) => abort(format!("can not connect to {}: {}", opts.path, e)),
    };
    match opts.command {
        Command::Call { object, func, data } => {
            match client.call(&object, &func, parse_data(&data)).await {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result).unwrap()),
                Err(e) => abort(format!("{}.{}: {}", object, func, e)),
            }
        }
        Command::Listen { event } => {
            let name = event.clone();
            if let Err(e) = client
                .listen(
                    &event,
                    Arc::new(move |data: Value| println!("{} {}", name.dimmed(), data)),
                )
                .await
            {
                abort(format!("{}: {}", event, e));
            }
            eprintln!("{}", format!("listening for {}, Ctrl-C to exit", event).dimmed());
            let _r = tokio::signal::ctrl_c().await;
        }
        Command::Send { event, data } => {
            if let Err(e) = client.send(&event, parse_data(&data)).await {
                abort(format!("{}: {}", event, e));
            }
            // the writer task owns the socket, give it a moment to flush
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
    client.disconnect();
}
