use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Subcommand;
use rand::RngCore;
use toml_edit::{DocumentMut, Item, Table, value};
use tracing::info;

#[derive(Subcommand)]
pub enum CmdConfig {
    /// Creates node config file if it doesn't exist and generates a keypair
    Init {
        /// Join an existing cluster instead of founding a new one
        #[arg(long)]
        join: bool,
    },
}

fn table<'a>(doc: &'a mut DocumentMut, key: &str) -> Result<&'a mut Table> {
    doc.entry(key)
        .or_insert(Item::Table(Table::new()))
        .as_table_mut()
        .with_context(|| format!("'{key}' in node config is not a table"))
}

impl CmdConfig {
    pub fn run(self, node_config_file: PathBuf, node_data_dir: &Path) -> Result<()> {
        let config_dir = node_config_file
            .parent()
            .context("node config file has no parent directory")?;
        let mut doc = if node_config_file.exists() {
            fs::read_to_string(&node_config_file)?
        } else {
            fs::create_dir_all(config_dir)?;
            "".to_owned()
        }
        .parse::<DocumentMut>()
        .context("could not parse node config file")?;

        match self {
            Self::Init { join } => {
                let secretkey_file = node_config_file.with_extension("secretkey");
                let secretkey_name = secretkey_file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .context("secret key file name is not valid UTF-8")?
                    .to_owned();

                let identity = table(&mut doc, "identity")?;
                if !identity.contains_key("secret_key") {
                    identity.insert("secret_key_file", value(secretkey_name));
                }

                let storage = table(&mut doc, "storage")?;
                if !storage.contains_key("path") {
                    let path = node_data_dir.join("log");
                    let path = path
                        .to_str()
                        .context("data directory path is not valid UTF-8")?;
                    storage.insert("path", value(path));
                }

                let cluster = table(&mut doc, "cluster")?;
                if !cluster.contains_key("bootstrap") {
                    cluster.insert("bootstrap", value(!join));
                }
                if !cluster.contains_key("peers") {
                    cluster.insert("peers", Item::Table(Table::new()));
                }

                if !secretkey_file.exists() {
                    info!("generating secure random secret key for node");
                    let mut bytes = [0u8; 32];
                    rand::rng().fill_bytes(&mut bytes);
                    fs::write(secretkey_file, bytes)?;
                }
            }
        }

        info!("writing to config file {node_config_file:?}");

        let tmp_path = node_config_file.with_extension("tmp");
        let mut tmp = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(doc.to_string().as_bytes())?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, node_config_file)?;
        Ok(())
    }
}
