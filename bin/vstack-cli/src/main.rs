// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use slog::{info, o, Drain, Level, Logger};

use vstack_client::{Client, HttpTransport};
use vstack_reconcile::plan::{plan_nic, plan_vm};
use vstack_reconcile::profiles::list_profiles;
use vstack_reconcile::{NicController, Plan, VmController, VmLocks};
use vstack_types::model::{NicState, VmState};
use vstack_types::VmId;

mod state;

use state::{Kind, StateStore};

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Reconcile declared vStack VMs and network ports
struct Opt {
    /// Provider settings file
    #[clap(short, long, default_value = "vstack.toml", action)]
    config: PathBuf,

    /// Directory holding the state of applied resources
    #[clap(long, default_value = ".vstack", action)]
    state_dir: PathBuf,

    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage a VM declared in a TOML file
    Vm {
        #[clap(subcommand)]
        cmd: VmCommand,
    },

    /// Manage a network port declared in a TOML file
    Nic {
        #[clap(subcommand)]
        cmd: NicCommand,
    },

    /// List the OS types and profiles the platform offers
    Profiles,
}

#[derive(Debug, Subcommand)]
enum VmCommand {
    /// Show what applying the declaration would do
    Plan { declaration: PathBuf },

    /// Create, update or replace the VM to match the declaration
    Apply { declaration: PathBuf },

    /// Re-read the VM and store its current state
    Refresh { declaration: PathBuf },

    /// Remove the VM
    Destroy { declaration: PathBuf },

    /// Adopt an existing VM under the declaration
    Import {
        declaration: PathBuf,

        /// Numeric VM id
        id: String,
    },

    /// Describe any VM by id
    Show { id: VmId },
}

#[derive(Debug, Subcommand)]
enum NicCommand {
    /// Show what applying the declaration would do
    Plan { declaration: PathBuf },

    /// Add, update or replace the port to match the declaration
    Apply { declaration: PathBuf },

    /// Re-read the port and store its current state
    Refresh { declaration: PathBuf },

    /// Detach the port from its VM
    Destroy { declaration: PathBuf },

    /// Adopt an existing port under the declaration
    Import {
        declaration: PathBuf,

        /// Port identifier, formatted as `<vm_id>/<port_id>`
        id: String,
    },
}

fn create_logger(opt: &Opt) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let level = if opt.debug { Level::Debug } else { Level::Info };
    let drain = slog::LevelFilter(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn describe_plan(plan: &Plan) -> String {
    match plan {
        Plan::Create => "create".to_string(),
        Plan::Replace(fields) => format!("replace ({} changed)", fields.join(", ")),
        Plan::Update => "update in place".to_string(),
        Plan::Unchanged => "no changes".to_string(),
    }
}

async fn login(opt: &Opt, log: &Logger) -> anyhow::Result<Client> {
    let config = vstack_config_toml::parse(&opt.config).with_context(|| {
        format!("loading provider settings from {}", opt.config.display())
    })?;
    let provider = &config.provider;
    let password = provider.password()?;
    let transport = HttpTransport::login(
        provider.base_url(),
        &provider.username,
        &password,
        provider.timeout(),
        log.clone(),
    )
    .await
    .with_context(|| format!("logging in to {}", provider.base_url()))?;
    Ok(Client::new(Arc::new(transport), log.clone()))
}

/// Loads stored VM state and refreshes it against the platform.
async fn current_vm(
    vms: &VmController,
    store: &StateStore,
    declaration: &Path,
) -> anyhow::Result<Option<VmState>> {
    let Some(prior) = store.load::<VmState>(Kind::Vm, declaration)? else {
        return Ok(None);
    };
    let state = vms
        .read(&prior)
        .await
        .with_context(|| format!("refreshing VM {}", prior.id))?;
    store.save(Kind::Vm, declaration, &state)?;
    Ok(Some(state))
}

/// Loads stored port state and refreshes it, forgetting a port that is no
/// longer attached.
async fn current_nic(
    nics: &NicController,
    store: &StateStore,
    declaration: &Path,
) -> anyhow::Result<Option<NicState>> {
    let Some(prior) = store.load::<NicState>(Kind::Nic, declaration)? else {
        return Ok(None);
    };
    let state = nics.read(&prior).await.with_context(|| {
        format!("refreshing port {} on VM {}", prior.id, prior.vm_id)
    })?;
    match &state {
        Some(state) => store.save(Kind::Nic, declaration, state)?,
        None => store.remove(Kind::Nic, declaration)?,
    }
    Ok(state)
}

async fn vm_command(
    cmd: VmCommand,
    vms: &VmController,
    store: &StateStore,
    log: &Logger,
) -> anyhow::Result<()> {
    match cmd {
        VmCommand::Plan { declaration } => {
            let config = vstack_config_toml::parse_vm(&declaration)?;
            let state = current_vm(vms, store, &declaration).await?;
            println!("{}", describe_plan(&plan_vm(&config, state.as_ref())));
        }
        VmCommand::Apply { declaration } => {
            let config = vstack_config_toml::parse_vm(&declaration)?;
            let prior = current_vm(vms, store, &declaration).await?;
            let plan = plan_vm(&config, prior.as_ref());
            info!(log, "applying VM declaration";
                "declaration" => %declaration.display(),
                "plan" => describe_plan(&plan));

            let state = match (plan, prior) {
                (Plan::Unchanged, Some(state)) => state,
                (Plan::Update, Some(state)) => vms.update(&config, &state).await?,
                (Plan::Replace(_), Some(state)) => {
                    vms.delete(&state).await?;
                    store.remove(Kind::Vm, &declaration)?;
                    vms.create(&config).await?
                }
                _ => vms.create(&config).await?,
            };
            store.save(Kind::Vm, &declaration, &state)?;
            print_json(&state)?;
        }
        VmCommand::Refresh { declaration } => {
            let state = current_vm(vms, store, &declaration)
                .await?
                .with_context(|| {
                    format!("no state stored for {}", declaration.display())
                })?;
            print_json(&state)?;
        }
        VmCommand::Destroy { declaration } => {
            let state = store
                .load::<VmState>(Kind::Vm, &declaration)?
                .with_context(|| {
                    format!("no state stored for {}", declaration.display())
                })?;
            vms.delete(&state).await?;
            store.remove(Kind::Vm, &declaration)?;
        }
        VmCommand::Import { declaration, id } => {
            let seeded = vms.import(&id)?;
            let state = vms.read(&seeded).await?;
            store.save(Kind::Vm, &declaration, &state)?;
            print_json(&state)?;
        }
        VmCommand::Show { id } => print_json(&vms.lookup(id).await?)?,
    }
    Ok(())
}

async fn nic_command(
    cmd: NicCommand,
    nics: &NicController,
    store: &StateStore,
    log: &Logger,
) -> anyhow::Result<()> {
    match cmd {
        NicCommand::Plan { declaration } => {
            let config = vstack_config_toml::parse_nic(&declaration)?;
            let state = current_nic(nics, store, &declaration).await?;
            println!("{}", describe_plan(&plan_nic(&config, state.as_ref())));
        }
        NicCommand::Apply { declaration } => {
            let config = vstack_config_toml::parse_nic(&declaration)?;
            let prior = current_nic(nics, store, &declaration).await?;
            let plan = plan_nic(&config, prior.as_ref());
            info!(log, "applying port declaration";
                "declaration" => %declaration.display(),
                "plan" => describe_plan(&plan));

            let state = match (plan, prior) {
                (Plan::Unchanged, Some(state)) => state,
                (Plan::Update, Some(state)) => nics.update(&config, &state).await?,
                (Plan::Replace(_), Some(state)) => {
                    nics.delete(&state).await?;
                    store.remove(Kind::Nic, &declaration)?;
                    nics.create(&config).await?
                }
                _ => nics.create(&config).await?,
            };
            store.save(Kind::Nic, &declaration, &state)?;
            print_json(&state)?;
        }
        NicCommand::Refresh { declaration } => {
            match current_nic(nics, store, &declaration).await? {
                Some(state) => print_json(&state)?,
                None => println!("port is gone; state removed"),
            }
        }
        NicCommand::Destroy { declaration } => {
            let state = store
                .load::<NicState>(Kind::Nic, &declaration)?
                .with_context(|| {
                    format!("no state stored for {}", declaration.display())
                })?;
            nics.delete(&state).await?;
            store.remove(Kind::Nic, &declaration)?;
        }
        NicCommand::Import { declaration, id } => {
            let seeded = nics.import(&id)?;
            let state = nics.read(&seeded).await?.with_context(|| {
                format!("port {} is not attached to VM {}", seeded.id, seeded.vm_id)
            })?;
            store.save(Kind::Nic, &declaration, &state)?;
            print_json(&state)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let log = create_logger(&opt);

    let client = login(&opt, &log).await?;
    let locks = Arc::new(VmLocks::new());
    let store = StateStore::new(&opt.state_dir);

    match opt.cmd {
        Command::Vm { cmd } => {
            let vms = VmController::new(client, locks, &log);
            vm_command(cmd, &vms, &store, &log).await?
        }
        Command::Nic { cmd } => {
            let nics = NicController::new(client, locks, &log);
            nic_command(cmd, &nics, &store, &log).await?
        }
        Command::Profiles => print_json(&list_profiles(&client).await?)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_subcommands() {
        let opt = Opt::try_parse_from([
            "vstack-cli",
            "--config",
            "site.toml",
            "vm",
            "import",
            "web.toml",
            "42",
        ])
        .unwrap();
        assert_eq!(opt.config, PathBuf::from("site.toml"));
        assert_eq!(opt.state_dir, PathBuf::from(".vstack"));
        assert!(matches!(
            opt.cmd,
            Command::Vm { cmd: VmCommand::Import { ref id, .. } } if id == "42"
        ));

        let opt =
            Opt::try_parse_from(["vstack-cli", "vm", "show", "7"]).unwrap();
        assert!(matches!(
            opt.cmd,
            Command::Vm { cmd: VmCommand::Show { id } } if id.get() == 7
        ));
        assert!(Opt::try_parse_from(["vstack-cli", "vm", "show", "0"]).is_err());
    }

    #[test]
    fn plans_read_plainly() {
        assert_eq!(describe_plan(&Plan::Create), "create");
        assert_eq!(
            describe_plan(&Plan::Replace(vec!["vdc_id", "guest"])),
            "replace (vdc_id, guest changed)"
        );
        assert_eq!(describe_plan(&Plan::Unchanged), "no changes");
    }
}
