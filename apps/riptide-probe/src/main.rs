mod cli;
mod logging;

use anyhow::{bail, Context, Result};
use clap::Parser;
use riptide::{StreamClient, SubscriptionHandler};
use serde_json::Value;
use tracing::info;

use cli::{CallArgs, Cli, Command, SubscribeArgs};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let config = cli.connection.to_config()?;
    let client = StreamClient::new(config);
    let outcome = match cli.command {
        Command::Ping => ping(&client).await,
        Command::Call(args) => call(&client, args).await,
        Command::Subscribe(args) => subscribe(&client, args).await,
    };
    client.stop().await;
    outcome
}

async fn ping(client: &StreamClient) -> Result<()> {
    if !client.is_connected().await {
        bail!("{client} is not responding");
    }
    println!("ok {}", client.config().endpoint());
    Ok(())
}

async fn call(client: &StreamClient, args: CallArgs) -> Result<()> {
    let output = if args.strict {
        client
            .request(&args.method, args.params)
            .await
            .with_context(|| format!("{} failed", args.method))?
    } else {
        client
            .call(&args.method, args.params)
            .await
            .with_context(|| format!("{} failed", args.method))?
            .unwrap_or(Value::Null)
    };
    print_json(&output)
}

async fn subscribe(client: &StreamClient, args: SubscribeArgs) -> Result<()> {
    let (handler, mut events) = SubscriptionHandler::channel();
    let subscription = client
        .subscribe(args.params, handler)
        .await
        .context("subscribe failed")?;
    info!(target: "riptide_probe", subscription = %subscription, "subscribed");

    let mut received = 0usize;
    let mut state = client.watch_state();
    loop {
        if args.count.is_some_and(|limit| received >= limit) {
            break;
        }
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    print_json(&event.result)?;
                    received += 1;
                }
                None => break,
            },
            _ = state.wait_for(|state| *state == riptide::ConnectionState::Closed) => {
                bail!("connection closed after {received} pushes");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let removed = client
        .unsubscribe(&subscription)
        .await
        .context("unsubscribe failed")?;
    info!(target: "riptide_probe", subscription = %subscription, removed, "unsubscribed");
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
