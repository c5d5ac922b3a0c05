use anyhow::{bail, Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    terminal,
};
use rendezvous::{
    CoordinatorClient, CoordinatorConfig, CoordinatorEvent, GameInfo, JoinResult, ServerAddress, Visibility,
};
use std::{
    cell::RefCell,
    env, fs,
    rc::Rc,
    thread,
    time::{Duration, Instant},
};

/// Host loop period
const TICK: Duration = Duration::from_millis(100);

/// Give up on a listing pass after this long
const LISTING_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args: Vec<String> = env::args().collect();
    let program = args.first().cloned().unwrap_or_else(|| "rendezvous".to_string());

    let config_path = take_option(&mut args, "--config")?;
    let json = take_flag(&mut args, "--json");
    let config = load_config(config_path.as_deref())?;

    if args.len() < 2 {
        print_usage(&program);
        std::process::exit(1);
    }

    match args[1].as_str() {
        "host" => {
            if args.len() < 3 {
                eprintln!("Usage: {} host <port> [name]", program);
                std::process::exit(1);
            }
            let port: u16 = args[2]
                .parse()
                .with_context(|| format!("Invalid port '{}'", args[2]))?;
            let name = args
                .get(3)
                .cloned()
                .unwrap_or_else(|| format!("Unnamed Server {}", rand::random::<u16>()));
            run_host(config, port, &name)?
        }
        "list" => run_list(config, json)?,
        "join" => {
            if args.len() < 3 {
                eprintln!("Usage: {} join <join-key>", program);
                std::process::exit(1);
            }
            let join_key = args[2].trim_start_matches('+');
            run_join(config, join_key)?
        }
        _ => {
            eprintln!("Error: Invalid mode '{}'", args[1]);
            eprintln!();
            print_usage(&program);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program_name: &str) {
    eprintln!("rendezvous - find and join games behind NAT through a rendezvous service");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  {} [--config <file>] host <port> [name]   # Advertise a game", program_name);
    eprintln!("  {} [--config <file>] list [--json]        # List public games", program_name);
    eprintln!("  {} [--config <file>] join <join-key>      # Connect to a game", program_name);
    eprintln!();
    eprintln!("CONFIGURATION:");
    eprintln!("  --config <file>       JSON file with client settings");
    eprintln!();
    eprintln!("  Environment variables (override the file):");
    eprintln!("    RENDEZVOUS_SERVER   Rendezvous service host:port");
    eprintln!("    STUN_SERVER         STUN relay host:port");
    eprintln!("    RUST_LOG            Log filter (default: info)");
}

/// Remove `name <value>` from `args`
fn take_option(args: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    let Some(index) = args.iter().position(|a| a == name) else {
        return Ok(None);
    };
    if index + 1 >= args.len() {
        bail!("{} needs a value", name);
    }
    let value = args.remove(index + 1);
    args.remove(index);
    Ok(Some(value))
}

/// Remove `name` from `args`, reporting whether it was present
fn take_flag(args: &mut Vec<String>, name: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != name);
    args.len() != before
}

fn load_config(path: Option<&str>) -> Result<CoordinatorConfig> {
    let mut config = match path {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("Cannot read config file {}", path))?;
            serde_json::from_str(&text).with_context(|| format!("Invalid config file {}", path))?
        }
        None => CoordinatorConfig::default(),
    };

    if let Ok(server) = env::var("RENDEZVOUS_SERVER") {
        config.coordinator_server = server;
    }
    if let Ok(server) = env::var("STUN_SERVER") {
        config.stun_server = server;
    }
    Ok(config)
}

/// Advertise a game until Ctrl+C
fn run_host(config: CoordinatorConfig, port: u16, name: &str) -> Result<()> {
    println!("Rendezvous service : {}", config.coordinator_server);
    println!("STUN relay         : {}", config.stun_server);
    println!("Hosting '{}' on port {}", name, port);
    println!("Press Ctrl+C or q to stop.");
    println!();

    let info = GameInfo {
        server_name: name.to_string(),
        server_revision: config.revision.clone(),
        clients_max: 25,
        companies_max: 15,
        spectators_max: 10,
        ..GameInfo::default()
    };

    let mut client = CoordinatorClient::new(config);
    client.register(Visibility::Public, port, info);

    terminal::enable_raw_mode().context("Cannot switch terminal to raw mode")?;
    let result = host_loop(&mut client);
    terminal::disable_raw_mode()?;

    client.stop_hosting();
    client.shutdown();
    result
}

fn host_loop(client: &mut CoordinatorClient) -> Result<()> {
    loop {
        client.send_receive();

        for event in client.take_events() {
            match event {
                CoordinatorEvent::Registered { join_key, connection_type } => {
                    print!("Registered: join-key +{} ({:?})\r\n", join_key, connection_type);
                }
                CoordinatorEvent::IncomingPeer { token, peer, .. } => {
                    print!("Peer {} connected (token {})\r\n", peer, token);
                }
                CoordinatorEvent::Disconnected => {
                    print!("Lost connection to the rendezvous service\r\n");
                }
                CoordinatorEvent::RegistrationRejected { detail } => {
                    print!("Registration rejected: {}\r\n", detail);
                    return Ok(());
                }
                CoordinatorEvent::ListingChanged => {}
            }
        }

        if event::poll(TICK)? {
            if let Event::Key(k) = event::read()? {
                match (k.code, k.modifiers) {
                    (KeyCode::Char('c'), KeyModifiers::CONTROL) | (KeyCode::Char('q'), _) => {
                        print!("\r\n");
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Run one listing pass and print the result
fn run_list(config: CoordinatorConfig, json: bool) -> Result<()> {
    let mut client = CoordinatorClient::new(config);
    client.get_listing();

    let deadline = Instant::now() + LISTING_TIMEOUT;
    let mut done = false;
    while !done {
        if Instant::now() > deadline {
            bail!("Timed out waiting for the game listing");
        }
        client.send_receive();
        done = client
            .take_events()
            .iter()
            .any(|e| matches!(e, CoordinatorEvent::ListingChanged));
        if !done && !client.is_listing() {
            bail!("Listing aborted: rendezvous service unreachable");
        }
        thread::sleep(TICK);
    }

    if json {
        let games: Vec<serde_json::Value> = client
            .game_list()
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "address": entry.address.to_string(),
                    "compatible": entry.compatible,
                    "info": entry.info,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&games)?);
        return Ok(());
    }

    println!("{} games", client.game_list().len());
    for entry in client.game_list().iter() {
        let key = match &entry.address {
            ServerAddress::JoinKey(key) => format!("+{}", key),
            ServerAddress::Direct(address) => address.to_string(),
        };
        println!(
            "  {:<12} {:<40} {:>2}/{:<2} clients  {}{}",
            key,
            entry.info.server_name,
            entry.info.clients_on,
            entry.info.clients_max,
            entry.info.server_revision,
            if entry.compatible { "" } else { " (incompatible)" },
        );
    }
    Ok(())
}

/// Join a game and report the peer we reached
fn run_join(config: CoordinatorConfig, join_key: &str) -> Result<()> {
    let deadline = Instant::now() + config.join_timeout() + Duration::from_secs(5);
    let mut client = CoordinatorClient::new(config);

    let result: Rc<RefCell<Option<JoinResult>>> = Rc::default();
    let sink = Rc::clone(&result);
    client
        .connect_to_server(join_key, move |r| *sink.borrow_mut() = Some(r))
        .with_context(|| format!("Cannot join +{}", join_key))?;

    println!("Joining +{} ...", join_key);
    loop {
        client.send_receive();
        if let Some(outcome) = result.borrow_mut().take() {
            return match outcome {
                JoinResult::Connected { stream, peer } => {
                    println!("Connected to {} (local {})", peer, stream.local_addr()?);
                    Ok(())
                }
                JoinResult::Failed(e) => Err(e).with_context(|| format!("Joining +{} failed", join_key)),
            };
        }
        if Instant::now() > deadline {
            client.cancel_join(join_key);
            bail!("Timed out joining +{}", join_key);
        }
        thread::sleep(TICK);
    }
}
