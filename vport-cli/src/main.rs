use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{ArgGroup, ArgMatches, CommandFactory, FromArgMatches, Parser};
use vport_net::client::{ClientError, ControlClient, validate_name};
use vport_net::config::DEFAULT_SOCKET;
use vport_net::protocol::{Action, Reply, ResultCode};

#[derive(Parser)]
#[command(name = "vport")]
#[command(about = "Control the vport virtual patch-panel", long_about = None)]
#[command(group(
    ArgGroup::new("operations")
        .required(true)
        .multiple(true)
        .args(["add_port", "remove_port", "connect_ports", "disconnect_port", "dump"])
))]
struct Cli {
    /// Control socket of the daemon
    #[arg(short, long, env = "VPORT_SOCKET", default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// How long to wait for each reply, in milliseconds
    #[arg(long, env = "VPORT_TIMEOUT_MS", default_value_t = 5000)]
    timeout_ms: u64,

    /// Add a port
    #[arg(short = 'a', long, value_name = "NAME")]
    add_port: Vec<String>,

    /// Remove a port. The port must be disconnected
    #[arg(short = 'r', long, value_name = "NAME")]
    remove_port: Vec<String>,

    /// Connect two ports
    #[arg(short = 'c', long, value_name = "NAME,NAME")]
    connect_ports: Vec<String>,

    /// Disconnect a port from its peer
    #[arg(short = 'd', long, value_name = "NAME")]
    disconnect_port: Vec<String>,

    /// Show the peer of a port
    #[arg(short = 'D', long, value_name = "NAME")]
    dump: Vec<String>,
}

/// One request, in command-line order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Operation {
    action: Action,
    first: String,
    second: String,
}

impl Operation {
    fn single(action: Action, name: &str) -> Self {
        Self {
            action,
            first: name.to_string(),
            second: String::new(),
        }
    }

    fn label(&self) -> String {
        match self.action {
            Action::Connect => format!("{} {},{}", self.action, self.first, self.second),
            _ => format!("{} {}", self.action, self.first),
        }
    }
}

/// Collect every operation flag, ordered by its position on the command line.
fn operations(cli: &Cli, matches: &ArgMatches) -> anyhow::Result<Vec<Operation>> {
    let mut ordered = Vec::new();

    push_ordered(&mut ordered, matches, "add_port", &cli.add_port, |v| {
        Ok(Operation::single(Action::Add, v))
    })?;
    push_ordered(&mut ordered, matches, "remove_port", &cli.remove_port, |v| {
        Ok(Operation::single(Action::Remove, v))
    })?;
    push_ordered(&mut ordered, matches, "connect_ports", &cli.connect_ports, |v| {
        let Some((first, second)) = v.split_once(',') else {
            bail!("--connect-ports expects NAME,NAME, got {v:?}");
        };
        Ok(Operation {
            action: Action::Connect,
            first: first.to_string(),
            second: second.to_string(),
        })
    })?;
    push_ordered(
        &mut ordered,
        matches,
        "disconnect_port",
        &cli.disconnect_port,
        |v| Ok(Operation::single(Action::Disconnect, v)),
    )?;
    push_ordered(&mut ordered, matches, "dump", &cli.dump, |v| {
        Ok(Operation::single(Action::Dump, v))
    })?;

    ordered.sort_by_key(|(index, _)| *index);
    Ok(ordered.into_iter().map(|(_, op)| op).collect())
}

fn push_ordered<F>(
    ordered: &mut Vec<(usize, Operation)>,
    matches: &ArgMatches,
    id: &str,
    values: &[String],
    build: F,
) -> anyhow::Result<()>
where
    F: Fn(&str) -> anyhow::Result<Operation>,
{
    for (index, value) in matches.indices_of(id).into_iter().flatten().zip(values) {
        ordered.push((index, build(value)?));
    }
    Ok(())
}

/// Reject every bad name before anything is sent.
fn validate(ops: &[Operation]) -> Result<(), ClientError> {
    for op in ops {
        validate_name(&op.first)?;
        if op.action == Action::Connect {
            validate_name(&op.second)?;
        }
    }
    Ok(())
}

async fn execute(client: &mut ControlClient, op: &Operation) -> Result<Reply, ClientError> {
    match op.action {
        Action::Add => client.add(&op.first).await,
        Action::Remove => client.remove(&op.first).await,
        Action::Connect => client.connect_ports(&op.first, &op.second).await,
        Action::Disconnect => client.disconnect(&op.first).await,
        Action::Dump => client.dump(&op.first).await,
    }
}

fn describe(op: &Operation, reply: &Reply) -> String {
    match (op.action, reply.result) {
        (Action::Dump, ResultCode::Ok) if reply.port.is_empty() => {
            format!("{}: not connected", op.label())
        }
        (Action::Dump, ResultCode::Ok) => format!("{}: {}", op.label(), reply.port),
        (_, result) => format!("{}: {}", op.label(), result),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    let ops = operations(&cli, &matches)?;
    validate(&ops)?;

    let mut client = ControlClient::connect(&cli.socket, Duration::from_millis(cli.timeout_ms))
        .context("Failed to create client socket")?;

    let mut failed = false;
    for op in &ops {
        match execute(&mut client, op).await {
            Ok(reply) => {
                failed |= !reply.result.is_ok();
                println!("{}", describe(op, &reply));
            }
            Err(e) => {
                failed = true;
                eprintln!("{}: {e}", op.label());
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
