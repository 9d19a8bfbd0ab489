//! Command-line access to the cryptfs entry points.
//!
//! The device is described by `ro.crypto.*` properties, read from a property file and/or given on
//! the command line. Each command prints what it found and exits with the status code of the
//! matching entry point.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::error;

use cryptfs_recovery::{
    config::CryptConfig,
    cryptfs::{CryptSession, GETFIELD_MAX_LEN},
    dm::{control::DmControl, DeviceMapper, SimDeviceMapper},
    footer::CryptType,
    props::{MemoryProperties, Properties},
};

fn parse_prop(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or(format!("expected KEY=VALUE, got `{s}`"))?;
    Ok((key.to_owned(), value.to_owned()))
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the crypto footer can be read
    CheckFooter,

    /// Unlock the device; prints the number of failed attempts (0 on success)
    CheckPasswd { password: String },

    /// Check a password against the master key unlocked by `check-passwd`
    VerifyPasswd {
        password: String,

        /// Unlock with this password first
        #[clap(long)]
        unlock: Option<String>,
    },

    /// Protect the master key with a new password
    Changepw {
        /// The password currently protecting the master key
        #[clap(long)]
        old: String,

        #[clap(long = "type", default_value = "password")]
        crypt_type: CryptType,

        new_password: String,
    },

    /// Print the type of password protecting the master key
    PasswordType,

    /// Report how far along encryption of the device is
    CryptoComplete,

    /// Print a persistent field
    Getfield { name: String },

    /// Set a persistent field
    Setfield { name: String, value: String },

    /// Encrypt the device in place
    Enable {
        #[clap(long = "type", default_value = "password")]
        crypt_type: CryptType,

        password: String,
    },

    /// Encrypt the device in place with the default password
    EnableDefault,

    /// Map an external volume with a known key, printing the decrypted device
    SetupExtVolume {
        label: String,
        device: PathBuf,

        /// The key, in hex
        hex_key: String,
    },

    /// Remove an external volume's mapping
    RevertExtVolume { label: String },
}

impl Command {
    fn execute(self, session: &mut CryptSession) -> i32 {
        match self {
            Command::CheckFooter => match session.check_footer() {
                Ok(()) => {
                    println!("Crypto footer OK");
                    0
                }
                Err(e) => report(e, |e| e.error_code()),
            },

            Command::CheckPasswd { password } => match session.check_passwd(&password) {
                Ok(failures) => {
                    println!("{failures}");
                    failures as i32
                }
                Err(e) => report(e, |e| e.error_code()),
            },

            Command::VerifyPasswd { password, unlock } => {
                if let Some(unlock) = unlock {
                    if let Err(e) = session.check_passwd(&unlock) {
                        return report(e, |e| e.error_code());
                    }
                }
                match session.verify_passwd(&password) {
                    Ok(true) => {
                        println!("Password matches");
                        0
                    }
                    Ok(false) => {
                        println!("Password does not match");
                        1
                    }
                    Err(e) => report(e, |e| e.error_code()),
                }
            }

            Command::Changepw {
                old,
                crypt_type,
                new_password,
            } => {
                let result = session
                    .check_passwd(&old)
                    .and_then(|failures| match failures {
                        0 => session.changepw(crypt_type.into(), &new_password),
                        _ => Err(anyhow::anyhow!("old password is wrong").into()),
                    });
                match result {
                    Ok(()) => 0,
                    Err(e) => report(e, |e| e.error_code()),
                }
            }

            Command::PasswordType => match session.get_password_type() {
                Ok(Some(crypt_type)) => {
                    println!("{crypt_type:?}");
                    u32::from(crypt_type) as i32
                }
                Ok(None) => {
                    println!("Inconsistent");
                    -1
                }
                Err(e) => report(e, |_| -1),
            },

            Command::CryptoComplete => {
                let state = session.crypto_complete();
                println!("{state:?}");
                state.code()
            }

            Command::Getfield { name } => match session.getfield(&name, GETFIELD_MAX_LEN) {
                Ok(value) => {
                    println!("{value}");
                    0
                }
                Err(e) => report(e, |e| e.getfield_code()),
            },

            Command::Setfield { name, value } => match session.setfield(&name, &value) {
                Ok(()) => 0,
                Err(e) => report(e, |e| e.setfield_code()),
            },

            Command::Enable {
                crypt_type,
                password,
            } => match session.enable(crypt_type.into(), &password) {
                Ok(()) => 0,
                Err(e) => report(e, |e| e.error_code()),
            },

            Command::EnableDefault => match session.enable_default() {
                Ok(()) => 0,
                Err(e) => report(e, |e| e.error_code()),
            },

            Command::SetupExtVolume {
                label,
                device,
                hex_key,
            } => {
                let key = match hex::decode(&hex_key) {
                    Ok(key) => zeroize::Zeroizing::new(key),
                    Err(e) => {
                        error!("Bad key: {e}");
                        return -1;
                    }
                };
                match session.setup_ext_volume(&label, &device, &key) {
                    Ok(path) => {
                        println!("{}", path.display());
                        0
                    }
                    Err(e) => report(e, |e| e.error_code()),
                }
            }

            Command::RevertExtVolume { label } => match session.revert_ext_volume(&label) {
                Ok(()) => 0,
                Err(e) => report(e, |e| e.error_code()),
            },
        }
    }
}

fn report<E: std::fmt::Display>(e: E, code: impl FnOnce(&E) -> i32) -> i32 {
    error!("{e:#}");
    code(&e)
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// A build.prop-style file of device properties
    #[clap(long)]
    prop_file: Option<PathBuf>,

    /// Set a device property; may be repeated
    #[clap(long = "prop", value_name = "KEY=VALUE", value_parser = parse_prop)]
    props: Vec<(String, String)>,

    /// Allow the footer and persistent data to be written
    #[clap(long)]
    allow_footer_writes: bool,

    /// Allow in-place encryption to be started (needs --allow-footer-writes)
    #[clap(long)]
    allow_enable: bool,

    /// Simulate device-mapper with plain files in this directory
    #[clap(long)]
    sim_dm: Option<PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

impl Cli {
    fn session(&self) -> Result<CryptSession> {
        let props = MemoryProperties::new();
        if let Some(path) = &self.prop_file {
            props.load_file(path)?;
        }
        for (key, value) in &self.props {
            props.set(key, value)?;
        }

        let config = CryptConfig::from_properties(&props)
            .context("Cannot configure the crypto device")?
            .footer_writes(self.allow_footer_writes)
            .enable_allowed(self.allow_enable);

        let dm: Box<dyn DeviceMapper> = match &self.sim_dm {
            Some(dir) => Box::new(SimDeviceMapper::new(dir)),
            None => Box::new(DmControl::open(&config.dm_control)?),
        };
        Ok(CryptSession::new(config, Box::new(props), dm))
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let mut session = args.session()?;
    let status = args.cmd.execute(&mut session);

    howudoin::disable();
    // Let the progress line be cleared before exiting
    std::thread::sleep(Duration::from_millis(10));
    process::exit(status)
}
