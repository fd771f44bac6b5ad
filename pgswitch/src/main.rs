use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use pgswitch::backend::{Address, Retry, Target};
use pgswitch::cli::{Cli, Commands};
use pgswitch::config::{self, Overrides};
use pgswitch::{migrate, selftest, shell, shutdown};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = if cli.config.exists() {
        config::load(&cli.config).map(|_| ())
    } else {
        config::from_env().map(|_| ())
    };

    if let Err(err) = loaded {
        eprintln!("{}", err);
        std::process::exit(1);
    }

    config::overrides(Overrides {
        db_url: cli.db_url.clone(),
        db_url_next: cli.db_url_next.clone(),
        json: cli.json.then_some(true),
        verbose: cli.verbose.then_some(true),
    });

    pgswitch::logger();

    let code = match cli.command.clone().unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::SwitchoverShell => switchover_shell().await,
        Commands::Migrate { up, down } => migrate_cmd(up, down).await,
        Commands::SelfTest { offline } => self_test(offline).await,
        Commands::Configcheck => configcheck(&cli.config),
    };

    std::process::exit(code);
}

fn check_config() -> Option<i32> {
    if let Err(err) = config::config().check() {
        eprintln!("{}", err);
        return Some(1);
    }

    None
}

async fn run() -> i32 {
    if let Some(code) = check_config() {
        return code;
    }

    let token = CancellationToken::new();
    shutdown::spawn(token.clone());

    match pgswitch::run(token).await {
        Ok(()) => 0,
        Err(err) => {
            error!("{}", err);
            1
        }
    }
}

async fn switchover_shell() -> i32 {
    if let Some(code) = check_config() {
        return code;
    }

    match shell::run().await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{}", err);
            err.kind().exit_code()
        }
    }
}

async fn migrate_cmd(up: Option<String>, down: Option<String>) -> i32 {
    if let Some(code) = check_config() {
        return code;
    }

    let addr = match Address::new(Target::Old, &config::config().general.db_url) {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("{}", err);
            return 1;
        }
    };

    let mut server = match Retry::default().connect(&addr).await {
        Ok(server) => server,
        Err(err) => {
            eprintln!("{}", err);
            return 1;
        }
    };

    let result = if let Some(name) = down {
        migrate::down(&mut server, &name).await
    } else {
        migrate::up(&mut server, up.as_deref()).await
    };

    match result {
        Ok(count) => {
            println!("{} migration step(s)", count);
            0
        }
        Err(err @ (migrate::Error::OutOfOrder { .. } | migrate::Error::Unexpected { .. })) => {
            eprintln!("{}", err);
            2
        }
        Err(err) => {
            eprintln!("{}", err);
            1
        }
    }
}

async fn self_test(offline: bool) -> i32 {
    if !offline {
        if let Some(code) = check_config() {
            return code;
        }
    }

    match selftest::run(offline).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("self-test failed: {}", err);
            3
        }
    }
}

fn configcheck(path: &std::path::Path) -> i32 {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            eprintln!("{}: {}", path.display(), err);
            return 1;
        }
    };

    match toml::from_str::<config::Config>(&contents) {
        Ok(config) => {
            if let Err(err) = config.check() {
                eprintln!("{}", err);
                return 1;
            }
            println!("configuration ok");
            0
        }
        Err(err) => {
            eprintln!("{}: {}", path.display(), err);
            1
        }
    }
}
