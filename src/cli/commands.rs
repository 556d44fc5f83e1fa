// file: src/cli/commands.rs
// version: 2.1.0
// guid: g7h8i9j0-k1l2-3456-7890-123456ghijkl

//! Command implementations for the CLI
//!
//! Every command returns the [`OperatorReport`] to print on failure; the
//! binary turns it into an exit code.

use super::args::{CacheCommand, CreateArgs, KeysCommand};
use crate::{
    config::{
        intent::{check_label, check_node_name, IntentDefaults, IntentRequest},
        loader::ConfigLoader,
        Settings, StatePaths,
    },
    error::{OperatorReport, ProvisionError},
    identity::{IdentityManager, IdentityStore, Purpose, RcgenTls, SshKeyGenerator},
    image::{IsoCache, NetworkDownloader},
    pipeline::{CancelToken, Pipeline, ProvisionOptions, ProvisionReport},
    platform::linux::REQUIRED_TOOLS,
    platform::{self, AlwaysConfirm, Confirmer, HostKind, HostPlatform, StdinConfirmer},
    record::{NodeRecord, NodeRecordWriter},
    utils::{format_size, SystemUtils},
    Result,
};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a CLI command
pub type CommandResult = std::result::Result<(), OperatorReport>;

/// Shared state every command starts from
pub struct Context {
    pub paths: StatePaths,
    pub settings: Settings,
    pub host: HostKind,
    pub json: bool,
    pub quiet: bool,
}

impl Context {
    /// Resolve the state tree, load `config.yaml` and detect the host
    pub fn load(json: bool, quiet: bool) -> Result<Self> {
        let paths = StatePaths::from_env()?;
        let settings = ConfigLoader::new().load_or_default(&paths)?;
        let host = HostKind::detect();
        info!("Host: {}, state: {}", host, paths.root().display());
        Ok(Self {
            paths,
            settings,
            host,
            json,
            quiet,
        })
    }

    fn platform(&self) -> Arc<dyn HostPlatform> {
        platform::for_host(self.host, &self.settings)
    }

    fn identities(&self) -> IdentityManager {
        IdentityManager::new(
            IdentityStore::new(self.paths.keys_dir()),
            Arc::new(SshKeyGenerator::new()),
            Arc::new(RcgenTls::new()),
        )
    }

    fn records(&self) -> NodeRecordWriter {
        NodeRecordWriter::new(self.paths.nodes_dir())
    }

    fn downloader(&self) -> NetworkDownloader {
        if self.json || self.quiet {
            NetworkDownloader::new().without_progress()
        } else {
            NetworkDownloader::new()
        }
    }

    fn confirmer(&self, force: bool) -> Arc<dyn Confirmer> {
        if force {
            Arc::new(AlwaysConfirm(true))
        } else {
            Arc::new(StdinConfirmer)
        }
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Provision a node
pub async fn create_command(ctx: &Context, args: CreateArgs, cancel: &CancelToken) -> CommandResult {
    let request = IntentRequest {
        node_name: args.node_name,
        description: args.description,
        coordinates: args.coordinates,
        label: Some(args.label),
        discovery_endpoint: args.discovery_server,
        iso_path: args.iso.as_deref().map(expand),
        device: Some(if args.auto_detect {
            "auto".to_string()
        } else {
            args.device.unwrap_or_default()
        }),
        created_by: args.created_by,
        owner_key_ref: args.owner_key.as_deref().map(expand),
        work_dir: args.work_dir.as_deref().map(expand),
        cache_dir: args.cache_dir.as_deref().map(expand),
    };
    let defaults = IntentDefaults {
        created_by: SystemUtils::operator_name(),
        work_dir: ctx.paths.default_work_root(ctx.host.is_windows_family()),
        cache_dir: ctx.paths.iso_cache_dir(),
    };
    let options = ProvisionOptions {
        force: args.force,
        keep_work_dir: args.keep_work_dir,
        overwrite_record: args.overwrite_record,
    };

    let pipeline = Pipeline::new(
        ctx.platform(),
        Arc::new(ctx.identities()),
        Arc::new(ctx.downloader()),
        ctx.records(),
        ctx.confirmer(args.force),
        ctx.settings.clone(),
    );
    let report = pipeline.provision(&request, &defaults, options, cancel).await?;

    if ctx.json {
        print_json(&report)?;
    } else {
        print_provision_report(&report);
    }
    Ok(())
}

fn print_provision_report(report: &ProvisionReport) {
    println!("{} {}", "Provisioned".green().bold(), report.node_name.bold());
    println!("  device:    {}", report.device.summary());
    println!(
        "  image:     {} ({})",
        report.image.path.display(),
        format_size(report.image.size_bytes)
    );
    println!(
        "  identity:  {}",
        if report.identity_reused { "reused" } else { "generated" }
    );
    println!("  owner:     {}", report.fingerprints.owner);
    println!("  community: {}", report.fingerprints.community);
    println!("  node:      {}", report.fingerprints.node);
    for entry in &report.seed_listing {
        println!("  seed:      {} ({})", entry.name, format_size(entry.size_bytes));
    }
    match (&report.record_path, &report.record_warning) {
        (Some(path), _) => println!("  record:    {}", path.display()),
        (None, Some(warning)) => println!(
            "  record:    {} ({}); run `syntropy record-node --node-name {}`",
            "not written".yellow(),
            warning,
            report.node_name
        ),
        (None, None) => {}
    }
    if let Some(dir) = &report.work_dir {
        println!("  work dir:  {}", dir.display());
    }
}

#[derive(Debug, Serialize)]
struct DeviceRow {
    device: platform::TargetDevice,
    eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// List block devices with their eligibility
pub async fn list_command(ctx: &Context) -> CommandResult {
    let platform = ctx.platform();
    let mut rows = Vec::new();
    for device in platform.list_block_devices().await? {
        let verdict = if device.removable {
            platform.validate_device(&device).await
        } else {
            Err(ProvisionError::NoDevice("not removable".to_string()))
        };
        let reason = match verdict {
            Ok(()) => None,
            Err(ProvisionError::DeviceRejected { reason, .. }) => Some(reason.to_string()),
            Err(ProvisionError::NoDevice(reason)) => Some(reason),
            Err(e) => return Err(e.into()),
        };
        rows.push(DeviceRow {
            eligible: reason.is_none(),
            device,
            reason,
        });
    }

    if ctx.json {
        print_json(&rows)?;
        return Ok(());
    }
    if rows.is_empty() {
        info!("No block devices found");
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:<24} {:<16} {:<10}",
        "DEVICE", "SIZE", "MODEL", "SERIAL", "STATUS"
    );
    println!("{:-<88}", "");
    for row in &rows {
        let status = match &row.reason {
            None => "eligible".green().to_string(),
            Some(reason) => reason.red().to_string(),
        };
        println!(
            "{:<24} {:<10} {:<24} {:<16} {}",
            row.device.path.display(),
            format_size(row.device.size_bytes),
            row.device.model,
            row.device.serial,
            status
        );
    }
    Ok(())
}

/// Wipe a device and leave one FAT32 partition labelled `label`
pub async fn format_command(ctx: &Context, device: &str, label: &str, force: bool) -> CommandResult {
    let violations = check_label(label);
    if !violations.is_empty() {
        return Err(ProvisionError::InvalidIntent(violations).into());
    }

    let platform = ctx.platform();
    let path = expand(device);
    let target = platform.describe_device(&path).await?.ok_or_else(|| {
        ProvisionError::NoDevice(format!("{} is not a block device on this host", path.display()))
    })?;
    platform.validate_device(&target).await?;

    let prompt = format!("Erase {} and create a FAT32 volume {}?", target.summary(), label);
    if !ctx.confirmer(force).confirm(&prompt).await? {
        return Err(ProvisionError::canceled("format (operator declined)").into());
    }

    platform.offline(&target).await?;
    let formatted = async {
        platform.reset_partition_table(&target).await?;
        let partition = platform.append_partition(&target, label, None).await?;
        platform.format_fat32(&partition, label).await
    }
    .await;
    let released = platform.online(&target).await;

    match (formatted, released) {
        (Ok(()), Ok(())) => {
            println!("{} {} as {}", "Formatted".green().bold(), target.summary(), label);
            Ok(())
        }
        (Ok(()), Err(release)) => Err(release.into()),
        (Err(primary), Ok(())) => Err(primary.into()),
        (Err(primary), Err(release)) => Err(ProvisionError::ReleaseFailed {
            primary: Box::new(primary),
            release: Box::new(release),
        }
        .into()),
    }
}

#[derive(Debug, Serialize)]
struct DebugInfo {
    version: &'static str,
    host: HostKind,
    state_dir: PathBuf,
    config_file: PathBuf,
    config_present: bool,
    running_as_root: bool,
    tools: Vec<(String, bool)>,
    settings: Settings,
}

/// Host diagnostics
pub async fn debug_command(ctx: &Context) -> CommandResult {
    let t = &ctx.settings.tools;
    let mut wanted: Vec<&str> = Vec::new();
    match ctx.host {
        HostKind::Linux => {
            wanted.push("lsblk");
            wanted.extend(REQUIRED_TOOLS);
        }
        HostKind::Wsl => {
            wanted.extend([t.powershell.as_str(), t.wsl.as_str(), "lsblk"]);
            wanted.extend(REQUIRED_TOOLS);
        }
        HostKind::Windows => wanted.push(t.powershell.as_str()),
    }
    let info = DebugInfo {
        version: crate::VERSION,
        host: ctx.host,
        state_dir: ctx.paths.root().to_path_buf(),
        config_file: ctx.paths.config_file(),
        config_present: ctx.paths.config_file().exists(),
        running_as_root: SystemUtils::is_root(),
        tools: wanted
            .iter()
            .map(|tool| (tool.to_string(), SystemUtils::command_exists(tool)))
            .collect(),
        settings: ctx.settings.clone(),
    };

    if ctx.json {
        print_json(&info)?;
        return Ok(());
    }

    println!("syntropy {}", info.version);
    println!("host:        {}", info.host);
    println!("state dir:   {}", info.state_dir.display());
    println!(
        "config:      {} ({})",
        info.config_file.display(),
        if info.config_present { "present" } else { "defaults" }
    );
    println!("root:        {}", if info.running_as_root { "yes" } else { "no" });
    println!("tools:");
    for (tool, found) in &info.tools {
        let mark = if *found { "✓".green() } else { "✗".red() };
        println!("  {} {}", mark, tool);
    }
    let missing = info.tools.iter().filter(|(_, found)| !found).count();
    if missing > 0 {
        warn!("{} required tools are missing", missing);
    }
    if !info.running_as_root && info.host != HostKind::Windows {
        warn!("raw device writes need root; rerun with sudo");
    }
    let settings = serde_yaml::to_string(&info.settings).map_err(ProvisionError::from)?;
    println!("settings:\n{}", settings);
    Ok(())
}

#[derive(Debug, Serialize)]
struct KeyRow {
    node: String,
    purpose: Purpose,
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    algorithm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    problem: Option<String>,
}

/// Key management
pub async fn keys_command(ctx: &Context, action: KeysCommand) -> CommandResult {
    let identities = ctx.identities();
    match action {
        KeysCommand::List => {
            let store = identities.store();
            let mut rows = Vec::new();
            for node in store.nodes()? {
                for purpose in Purpose::ALL {
                    let (fingerprint, algorithm, problem) = match store.read(&node, purpose) {
                        Ok(Some(key)) => (
                            Some(key.record.sha256),
                            Some(key.record.algorithm.to_string()),
                            None,
                        ),
                        Ok(None) => (None, None, Some("missing".to_string())),
                        Err(e) => (None, None, Some(e.to_string())),
                    };
                    rows.push(KeyRow {
                        node: node.clone(),
                        purpose,
                        fingerprint,
                        algorithm,
                        problem,
                    });
                }
            }
            if ctx.json {
                print_json(&rows)?;
                return Ok(());
            }
            if rows.is_empty() {
                info!("No stored identities in {}", store.dir().display());
                return Ok(());
            }
            for row in &rows {
                match (&row.fingerprint, &row.problem) {
                    (Some(fp), _) => println!(
                        "{:<24} {:<10} {:<12} {}",
                        row.node,
                        row.purpose.as_str(),
                        row.algorithm.as_deref().unwrap_or(""),
                        fp
                    ),
                    (None, problem) => println!(
                        "{:<24} {:<10} {}",
                        row.node,
                        row.purpose.as_str(),
                        problem.as_deref().unwrap_or("").red()
                    ),
                }
            }
            Ok(())
        }
        KeysCommand::Delete { node, force } => {
            let prompt = format!("Delete every stored key of {}? This cannot be undone", node);
            if !ctx.confirmer(force).confirm(&prompt).await? {
                return Err(ProvisionError::canceled("keys delete (operator declined)").into());
            }
            let removed = identities.store().delete(&node)?;
            if removed.is_empty() {
                warn!("No keys stored for {}", node);
            }
            println!("Removed {} files for {}", removed.len(), node);
            Ok(())
        }
        KeysCommand::RotateOwner { node } => {
            let keypair = identities.rotate_owner_key(&node).await?;
            println!("{} owner key of {}", "Rotated".green().bold(), node);
            println!("  fingerprint: {}", keypair.fingerprint);
            warn!("Media provisioned earlier for {} still carries the previous owner fingerprint", node);
            Ok(())
        }
    }
}

/// Re-issue the node record from the stored identity
pub async fn record_node_command(
    ctx: &Context,
    node_name: &str,
    description: Option<String>,
    created_by: Option<String>,
) -> CommandResult {
    let violations = check_node_name(node_name);
    if !violations.is_empty() {
        return Err(ProvisionError::InvalidIntent(violations).into());
    }

    let identities = ctx.identities();
    let store = identities.store();
    let mut fingerprints = Vec::with_capacity(Purpose::ALL.len());
    for purpose in Purpose::ALL {
        let key = store.read(node_name, purpose)?.ok_or_else(|| {
            ProvisionError::identity(format!(
                "no stored {} key for {}; provision the node first",
                purpose, node_name
            ))
        })?;
        fingerprints.push(key.record.sha256);
    }
    let [owner, community, node]: [String; 3] = fingerprints
        .try_into()
        .map_err(|_| ProvisionError::identity("incomplete identity"))?;

    let records = ctx.records();
    let previous = records.read(node_name).await?;
    let description = description
        .or_else(|| previous.as_ref().map(|r| r.description.clone()))
        .unwrap_or_default();
    let record = NodeRecord::provisioned(
        node_name,
        description,
        created_by.unwrap_or_else(SystemUtils::operator_name),
        crate::identity::Fingerprints {
            owner,
            community,
            node,
        },
        store.dir(),
    );
    let path = records.write(&record, true).await?;

    if ctx.json {
        print_json(&record)?;
    } else {
        println!("{} {}", "Recorded".green().bold(), path.display());
    }
    Ok(())
}

/// Cache inspection
pub async fn cache_command(ctx: &Context, action: CacheCommand) -> CommandResult {
    match action {
        CacheCommand::List => {
            let cache = IsoCache::new(
                ctx.paths.iso_cache_dir(),
                Arc::new(ctx.downloader()),
                ctx.settings.timeouts.download(),
            );
            let images = cache.cached().await?;
            if ctx.json {
                print_json(&images)?;
                return Ok(());
            }
            if images.is_empty() {
                info!("No cached images in {}", cache.dir().display());
                return Ok(());
            }
            for image in &images {
                let status = if crate::image::is_plausible_image_size(image.size_bytes) {
                    "ok".green()
                } else {
                    "truncated".red()
                };
                println!(
                    "{:<48} {:>10} {}",
                    image.path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
                    format_size(image.size_bytes),
                    status
                );
            }
            Ok(())
        }
    }
}

/// Print a failure for the operator; JSON when requested
pub fn print_report(report: &OperatorReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(text) => eprintln!("{}", text),
            Err(_) => eprintln!("{}: {}", report.code, report.message),
        }
        return;
    }
    eprintln!("{} [{}] {}", "error".red().bold(), report.code, report.message);
    match (&report.phase, &report.subphase) {
        (Some(phase), Some(sub)) => eprintln!("  phase: {} ({})", phase, sub),
        (Some(phase), None) => eprintln!("  phase: {}", phase),
        (None, Some(sub)) => eprintln!("  step:  {}", sub),
        (None, None) => {}
    }
    eprintln!("  {} {}", "hint:".yellow(), report.suggestion);
}
