//! Demo pair for a running manager: an echo executor and a ping client.

use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};

use kiln::client::ManagerClient;
use kiln::config;
use kiln::daemon::ipc::TaskInput;
use kiln::service::{ServiceRunner, TaskService};

#[derive(Parser)]
#[command(name = "kiln-ping", version, about = "kiln demo client and echo service")]
struct Cli {
    /// Manager endpoint; defaults to KILN_ENDPOINT or 127.0.0.1:8080.
    #[arg(long)]
    endpoint: Option<String>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register an echo executor and serve tasks until interrupted.
    Serve {
        /// Executor name registered with the manager.
        #[arg(long, default_value = "kiln-ping")]
        name: String,
    },

    /// Open a session, send a payload, print the output and round trip.
    Client {
        #[arg(default_value = "k82cn")]
        payload: String,
    },
}

struct PingService;

impl TaskService for PingService {
    fn on_session_bound(&mut self, session: &kiln::daemon::ipc::Metadata) {
        tracing::info!(session = %session.id, "session bound");
    }

    fn on_task_invoke(&mut self, input: &TaskInput) -> Result<String, String> {
        Ok(format!("Hello {}!", input.input))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    kiln::telemetry::init(cli.verbose);
    let endpoint = cli.endpoint.unwrap_or_else(config::manager_endpoint);

    let result = match cli.command {
        Command::Serve { name } => serve(endpoint, name),
        Command::Client { payload } => ping(endpoint, &payload),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("kiln-ping: {err}");
            ExitCode::FAILURE
        }
    }
}

fn serve(endpoint: String, name: String) -> Result<(), kiln::Error> {
    let runner = ServiceRunner::new(endpoint, name);

    let stop = runner.stop_flag();
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, stop.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, stop);

    runner.run(&mut PingService)?;
    Ok(())
}

fn ping(endpoint: String, payload: &str) -> Result<(), kiln::Error> {
    let client = ManagerClient::new(endpoint);
    let conn = client.new_connection()?;
    let ssn = conn.new_session()?;

    let before = Instant::now();
    let task = ssn.send_input(payload)?;
    println!("Task <{}/{}> was created", task.session_id, task.task_id);

    let output = ssn.recv_output(&task)?;
    let rtt = before.elapsed().as_millis();
    println!("Task output is: {output} ({rtt} ms)");

    ssn.close()?;
    conn.close()?;
    Ok(())
}
