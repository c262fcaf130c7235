use anyhow::Context;
use clap::{Parser, Subcommand};
use simplelog::{Config, LevelFilter, SimpleLogger};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use vault::VaultSession;

#[derive(Parser)]
#[command(name = "vault", version, about = "Single-user encrypted key-value vault")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create a new, empty vault for a user
    Create {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(long)]
        password: String,
        /// Argon2 memory cost in KiB
        #[arg(long, default_value_t = vault::constants::DEFAULT_M_COST_KIB)]
        m_cost_kib: u32,
        /// Argon2 time cost (iterations)
        #[arg(long, default_value_t = vault::constants::DEFAULT_T_COST)]
        t_cost: u32,
    },

    /// Store a value under a key
    Add {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
        #[arg(long, default_value_t = 0)]
        entry_type: u8,
    },

    /// Read a value back by key
    Get {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        key: String,
    },

    /// Replace an existing value
    Update {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
        #[arg(long, default_value_t = 0)]
        entry_type: u8,
    },

    /// Remove a key
    Delete {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        key: String,
    },

    /// List every stored key
    List {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(long)]
        password: String,
    },

    /// Re-wrap the master key under a new password
    ChangePassword {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(long)]
        old_password: String,
        #[arg(long)]
        new_password: String,
        #[arg(long, default_value_t = vault::constants::DEFAULT_M_COST_KIB)]
        m_cost_kib: u32,
        #[arg(long, default_value_t = vault::constants::DEFAULT_T_COST)]
        t_cost: u32,
    },
}

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn main() -> anyhow::Result<()> {
    let _ = SimpleLogger::init(LevelFilter::Info, Config::default());
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Create { dir, user, password, m_cost_kib, t_cost } => {
            let mut session = VaultSession::init()?;
            session
                .create(&dir, &user, password.as_bytes(), m_cost_kib, t_cost)
                .with_context(|| format!("creating vault for {user} in {}", dir.display()))?;
            println!("created vault for {user}");
        }

        Cmd::Add { dir, user, password, key, value, entry_type } => {
            let mut session = VaultSession::init()?;
            session.open(&dir, &user, password.as_bytes(), vault::constants::DEFAULT_M_COST_KIB, vault::constants::DEFAULT_T_COST)
                .with_context(|| format!("opening vault for {user}"))?;
            session.add(entry_type, &key, value.as_bytes(), now()).with_context(|| format!("adding key {key}"))?;
            println!("added {key}");
        }

        Cmd::Get { dir, user, password, key } => {
            let mut session = VaultSession::init()?;
            session.open(&dir, &user, password.as_bytes(), vault::constants::DEFAULT_M_COST_KIB, vault::constants::DEFAULT_T_COST)
                .with_context(|| format!("opening vault for {user}"))?;
            session.open_key(&key).with_context(|| format!("opening key {key}"))?;
            let (value, entry_type) = session.read_value()?;
            match std::str::from_utf8(&value) {
                Ok(s) => println!("{s}  (type={entry_type})"),
                Err(_) => println!("{value:?}  (type={entry_type})"),
            }
        }

        Cmd::Update { dir, user, password, key, value, entry_type } => {
            let mut session = VaultSession::init()?;
            session.open(&dir, &user, password.as_bytes(), vault::constants::DEFAULT_M_COST_KIB, vault::constants::DEFAULT_T_COST)
                .with_context(|| format!("opening vault for {user}"))?;
            session.update(entry_type, &key, value.as_bytes(), now()).with_context(|| format!("updating key {key}"))?;
            println!("updated {key}");
        }

        Cmd::Delete { dir, user, password, key } => {
            let mut session = VaultSession::init()?;
            session.open(&dir, &user, password.as_bytes(), vault::constants::DEFAULT_M_COST_KIB, vault::constants::DEFAULT_T_COST)
                .with_context(|| format!("opening vault for {user}"))?;
            session.delete(&key).with_context(|| format!("deleting key {key}"))?;
            println!("deleted {key}");
        }

        Cmd::List { dir, user, password } => {
            let mut session = VaultSession::init()?;
            session.open(&dir, &user, password.as_bytes(), vault::constants::DEFAULT_M_COST_KIB, vault::constants::DEFAULT_T_COST)
                .with_context(|| format!("opening vault for {user}"))?;
            for key in session.list_keys()? {
                println!("{key}");
            }
        }

        Cmd::ChangePassword { dir, user, old_password, new_password, m_cost_kib, t_cost } => {
            let mut session = VaultSession::init()?;
            session.open(&dir, &user, old_password.as_bytes(), vault::constants::DEFAULT_M_COST_KIB, vault::constants::DEFAULT_T_COST)
                .with_context(|| format!("opening vault for {user}"))?;
            session
                .change_password(old_password.as_bytes(), new_password.as_bytes(), m_cost_kib, t_cost)
                .context("changing password")?;
            println!("password changed for {user}");
        }
    }

    Ok(())
}
