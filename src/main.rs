use anyhow::Result;
use ballotdesk::config::Config;
use ballotdesk::connectors::ConnectorRegistry;
use ballotdesk::contract::Candidate;
use ballotdesk::driver::{Command, SessionDriver, SessionHandle};
use ballotdesk::gateway::ProviderGateway;
use ballotdesk::operation_log::OperationLog;
use ballotdesk::session::{FormField, SessionSnapshot};
use ballotdesk::user_settings::{SettingsTokenStore, UserSettings};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const HELP: &str = "\
commands:
  connect | reset
  seats | leader | ended           refresh one contract read
  set <state|a|b|seats> <value>    edit the result form
  submit | end | resume            contract writes
  status | log | help | quit";

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let mut config = Config::from_env()?;
    let settings = UserSettings::load();
    if std::env::var("BALLOT_RPC_URL").is_err() {
        if let Some(rpc) = settings.get_custom_rpc(config.chain_id) {
            info!("Using custom RPC for chain {}: {}", config.chain_id, rpc);
            config.rpc_url = rpc.clone();
            config.validated_rpc_url()?;
        }
    }
    info!(
        "Election contract {:?} on {} ({})",
        config.contract_address,
        config.network_label(),
        config.chain_id
    );

    let operation_log = OperationLog::new();
    let gateway = Arc::new(ProviderGateway::new(
        Arc::new(ConnectorRegistry::new(config.clone())),
        Arc::new(SettingsTokenStore::new()),
    ));
    let (session, driver) = SessionDriver::spawn(
        gateway,
        config.contract_address,
        config.chain_id,
        Some(operation_log.clone()),
    );

    tokio::spawn(print_snapshots(session.clone()));
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            [] => continue,
            ["quit" | "exit"] => break,
            ["help"] => {
                println!("{}", HELP);
                continue;
            }
            ["status"] => {
                print_snapshot(&session.snapshot());
                continue;
            }
            ["log"] => {
                match operation_log.read() {
                    Ok(content) if content.is_empty() => println!("(operation log is empty)"),
                    Ok(content) => println!("{}", content),
                    Err(e) => warn!("Failed to read operation log: {}", e),
                }
                continue;
            }
            ["connect"] => Command::Connect,
            ["reset"] => Command::Reset,
            ["seats"] => Command::RefreshSeats,
            ["leader"] => Command::RefreshLeader,
            ["ended"] => Command::RefreshHasEnded,
            ["submit"] => Command::SubmitResult,
            ["end"] => Command::EndElection,
            ["resume"] => Command::ResumeElection,
            ["set", field, rest @ ..] => {
                let field = match *field {
                    "state" => FormField::Region,
                    "a" => FormField::VotesA,
                    "b" => FormField::VotesB,
                    "seats" => FormField::Seats,
                    other => {
                        println!("unknown field '{}'", other);
                        continue;
                    }
                };
                Command::UpdateField(field, rest.join(" "))
            }
            _ => {
                println!("unknown command, type 'help'");
                continue;
            }
        };
        if session.send(command).is_err() {
            break;
        }
    }

    let _ = session.shutdown();
    driver.await?;
    Ok(())
}

async fn print_snapshots(session: SessionHandle) {
    let mut updates = session.subscribe();
    let mut last_info = None;
    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();
        if let Some(info) = &snapshot.last_info {
            if last_info.as_ref() != Some(&info.timestamp) {
                last_info = Some(info.timestamp);
                println!("> {}", info.message);
                if let Some(link) = &info.link {
                    println!("  {}", link);
                }
            }
        }
    }
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    println!("status:   {:?}{}", snapshot.connection_status, if snapshot.fetching { " (busy)" } else { "" });
    if let Some(account) = snapshot.account_address {
        println!("account:  {:?}", account);
    }
    println!(
        "chain:    {} ({})",
        snapshot.chain_id,
        ballotdesk::config::network_label(snapshot.chain_id)
    );
    let seats: Vec<String> = Candidate::ALL
        .iter()
        .map(|c| format!("{} {}", c.label(), snapshot.election.seats.get(*c)))
        .collect();
    println!("seats:    {}", seats.join(" / "));
    if !snapshot.election.current_leader_label.is_empty() {
        println!("leader:   {}", snapshot.election.current_leader_label);
    }
    println!("ended:    {}", snapshot.election.has_ended);
    let form = &snapshot.form;
    println!(
        "form:     state='{}' a={} b={} seats={}",
        form.region_name, form.votes_a, form.votes_b, form.delegate_seats
    );
    if let Some(info) = &snapshot.last_info {
        println!("info:     {} ({})", info.message.lines().next().unwrap_or_default(), info.time_ago());
    }
    if let Some(tx) = &snapshot.active_transaction {
        println!("tx:       {:?} {}", tx.status, tx.status_message);
        if let Some(link) = &tx.explorer_link {
            println!("          {}", link);
        }
    }
}
