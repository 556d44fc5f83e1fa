// file: src/pipeline/mod.rs
// version: 1.1.0
// guid: e2b7c5a9-8d14-4f30-a6e9-3c1f0d7b842e

//! The "create node" pipeline
//!
//! Phases 1-5 are pure or reproducible and honor cancellation immediately.
//! Phases 6-10 touch the device: once [`Phase::AcquireDevice`] starts, the
//! device is released exactly once whatever happens, and any failure is
//! terminal for the session. The node record is written only after a
//! successful release.

pub mod phase;
pub mod session;
pub mod tracker;

pub use phase::{CancelToken, Phase};
pub use session::ProvisioningSession;
pub use tracker::{DeviceState, DeviceTracker};

use crate::config::intent::{DeviceSelector, IntentDefaults, IntentRequest, ProvisionIntent};
use crate::config::Settings;
use crate::error::{OperatorReport, ProvisionError};
use crate::identity::{Fingerprints, IdentityManager, ResolvedIdentity};
use crate::image::{InstallImage, IsoCache, ReleaseCandidate, ReleaseFetcher};
use crate::logging::with_phase_span;
use crate::platform::{
    Confirmer, HostPlatform, MountPoint, PartitionHandle, Subphase, TargetDevice,
    SEED_PARTITION_NAME,
};
use crate::record::{NodeRecord, NodeRecordWriter};
use crate::seed::{SeedBundle, SeedDerived, SeedRenderer};
use crate::utils::format_size;
use crate::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// FAT volume label cloud-init looks for
pub const SEED_VOLUME_LABEL: &str = "CIDATA";

/// Operator switches for one run
#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisionOptions {
    /// Skip the interactive confirmation before touching the device
    pub force: bool,
    /// Keep the session work directory after success
    pub keep_work_dir: bool,
    /// Replace an existing node record even for a fresh identity
    pub overwrite_record: bool,
}

/// One file found on the seed partition before unmount
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedFileEntry {
    pub name: String,
    pub size_bytes: u64,
}

/// What a successful run produced
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub session_id: String,
    pub node_name: String,
    pub device: TargetDevice,
    pub image: InstallImage,
    pub fingerprints: Fingerprints,
    pub identity_reused: bool,
    pub seed_listing: Vec<SeedFileEntry>,
    pub record_path: Option<PathBuf>,
    /// Set when the media is ready but the node record could not be written
    pub record_warning: Option<String>,
    /// Retained work directory, if any
    pub work_dir: Option<PathBuf>,
    pub completed: Vec<Phase>,
}

/// A run that stopped, and how far it got
#[derive(Debug, Error)]
#[error("{phase} failed: {error}")]
pub struct SessionFailure {
    pub phase: Phase,
    pub completed: Vec<Phase>,
    #[source]
    pub error: ProvisionError,
    /// Retained for post-mortem
    pub work_dir: Option<PathBuf>,
}

impl SessionFailure {
    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }

    pub fn report(&self) -> OperatorReport {
        let mut report = self.error.report();
        report.phase = Some(self.phase.name().to_string());
        report
    }
}

impl From<SessionFailure> for OperatorReport {
    fn from(failure: SessionFailure) -> Self {
        failure.report()
    }
}

/// Everything produced by the pure phases
struct Prepared {
    identity: ResolvedIdentity,
    image: InstallImage,
    device: TargetDevice,
    seed: SeedBundle,
}

/// Orchestrates identity, image, seed and device work for one node
pub struct Pipeline {
    platform: Arc<dyn HostPlatform>,
    identities: Arc<IdentityManager>,
    fetcher: Arc<dyn ReleaseFetcher>,
    candidates: Option<Vec<ReleaseCandidate>>,
    records: NodeRecordWriter,
    confirmer: Arc<dyn Confirmer>,
    settings: Settings,
}

impl Pipeline {
    pub fn new(
        platform: Arc<dyn HostPlatform>,
        identities: Arc<IdentityManager>,
        fetcher: Arc<dyn ReleaseFetcher>,
        records: NodeRecordWriter,
        confirmer: Arc<dyn Confirmer>,
        settings: Settings,
    ) -> Self {
        Self {
            platform,
            identities,
            fetcher,
            candidates: None,
            records,
            confirmer,
            settings,
        }
    }

    /// Override the ranked release list
    pub fn with_candidates(mut self, candidates: Vec<ReleaseCandidate>) -> Self {
        self.candidates = Some(candidates);
        self
    }

    /// Run every phase for `request`
    pub async fn provision(
        &self,
        request: &IntentRequest,
        defaults: &IntentDefaults,
        options: ProvisionOptions,
        cancel: &CancelToken,
    ) -> std::result::Result<ProvisionReport, SessionFailure> {
        info!("[{}/{}] {}", Phase::ValidateIntent.step(), Phase::TOTAL, Phase::ValidateIntent);
        let intent = self.validate(request, defaults).map_err(|error| SessionFailure {
            phase: Phase::ValidateIntent,
            completed: Vec::new(),
            error,
            work_dir: None,
        })?;
        let mut session =
            ProvisioningSession::start(intent, self.platform.kind()).map_err(|error| SessionFailure {
                phase: Phase::ValidateIntent,
                completed: Vec::new(),
                error,
                work_dir: None,
            })?;

        match self.run(&mut session, options, cancel).await {
            Ok(mut report) => {
                session.succeed();
                if options.keep_work_dir {
                    report.work_dir = Some(session.work_dir().to_path_buf());
                } else {
                    session.cleanup();
                }
                Ok(report)
            }
            Err(error) => {
                let failure = SessionFailure {
                    phase: session.phase,
                    completed: session.completed.clone(),
                    error,
                    work_dir: Some(session.work_dir().to_path_buf()),
                };
                session.fail(failure.report());
                error!("{}; work directory kept at {}", failure, session.work_dir().display());
                Err(failure)
            }
        }
    }

    fn validate(&self, request: &IntentRequest, defaults: &IntentDefaults) -> Result<ProvisionIntent> {
        let intent = ProvisionIntent::validate(request, defaults)?;
        if !self.platform.supports_raw_write() {
            return Err(ProvisionError::unsupported(format!(
                "raw device writes are not implemented for {} hosts",
                self.platform.kind()
            )));
        }
        let missing = self.platform.missing_tools();
        if !missing.is_empty() {
            return Err(ProvisionError::MissingTools(missing));
        }
        Ok(intent)
    }

    async fn run(
        &self,
        session: &mut ProvisioningSession,
        options: ProvisionOptions,
        cancel: &CancelToken,
    ) -> Result<ProvisionReport> {
        let prepared = self.prepare(session, cancel).await?;

        session.begin(Phase::AcquireDevice);
        if !options.force {
            self.confirm(&prepared.device).await?;
        }

        let mut tracker = DeviceTracker::new();
        let outcome = self.destructive(session, &prepared, &mut tracker, cancel).await;
        let seed_listing = self.release(session, &prepared.device, &mut tracker, outcome).await?;

        // Record only after a successful release
        session.begin(Phase::RecordNode);
        let reused = prepared.identity.reused();
        let fingerprints = prepared.identity.identity.fingerprints();
        let (record_path, record_warning) = match self
            .record(&session.intent, &fingerprints, options.overwrite_record || reused)
            .await
        {
            Ok(path) => (Some(path), None),
            Err(e) => {
                warn!(
                    "Media for {} is ready but the node record was not written: {}; reissue `syntropy record-node`",
                    session.intent.node_name(),
                    e
                );
                (None, Some(e.to_string()))
            }
        };
        session.complete(Phase::RecordNode);

        info!(
            "Provisioned {} on {}",
            session.intent.node_name(),
            prepared.device.summary()
        );
        Ok(ProvisionReport {
            session_id: session.session_id.to_string(),
            node_name: session.intent.node_name().to_string(),
            device: prepared.device,
            image: prepared.image,
            fingerprints,
            identity_reused: reused,
            seed_listing,
            record_path,
            record_warning,
            work_dir: None,
            completed: session.completed.clone(),
        })
    }

    /// Phases 2-5
    async fn prepare(&self, session: &mut ProvisioningSession, cancel: &CancelToken) -> Result<Prepared> {
        let intent = session.intent.clone();

        let identity = self
            .phase(session, Phase::ResolveIdentity, cancel, || {
                self.identities
                    .ensure_identity(intent.node_name(), intent.owner_key_ref())
            })
            .await?;
        if identity.reused() {
            info!("existing identity loaded for {}", intent.node_name());
        }
        session.identity_snapshot = Some(identity.identity.fingerprints());

        let image = self
            .phase(session, Phase::ResolveImage, cancel, || self.resolve_image(&intent))
            .await?;
        session.chosen_image = Some(image.path.clone());

        let device = self
            .phase(session, Phase::ResolveDevice, cancel, || self.resolve_device(&intent))
            .await?;
        session.chosen_device = Some(device.clone());

        let tls_dir = session.tls_dir();
        let seed_dir = session.seed_dir();
        let (intent_ref, identity_ref) = (&intent, &identity.identity);
        let seed = self
            .phase(session, Phase::RenderSeed, cancel, || async move {
                let tls = self
                    .identities
                    .generate_tls_bundle(intent_ref.node_name(), &tls_dir)
                    .await?;
                let derived = SeedDerived::new(intent_ref.node_name());
                let seed = SeedRenderer::new(self.settings.seed.clone()).render(
                    intent_ref,
                    identity_ref,
                    &tls,
                    &derived,
                )?;
                seed.write_to(&seed_dir)?;
                Ok(seed)
            })
            .await?;

        Ok(Prepared {
            identity,
            image,
            device,
            seed,
        })
    }

    /// Run a pure phase; cancellation stops it before it starts or while it runs
    async fn phase<T, F, Fut>(
        &self,
        session: &mut ProvisioningSession,
        phase: Phase,
        cancel: &CancelToken,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        cancel.check(phase)?;
        session.begin(phase);
        let work = with_phase_span(phase.name(), phase.step(), Phase::TOTAL, f);
        let value = cancel.run(phase, work).await?;
        session.complete(phase);
        Ok(value)
    }

    async fn resolve_image(&self, intent: &ProvisionIntent) -> Result<InstallImage> {
        let mut cache = IsoCache::new(
            intent.cache_dir(),
            self.fetcher.clone(),
            self.settings.timeouts.download(),
        );
        if let Some(candidates) = &self.candidates {
            cache = cache.with_candidates(candidates.clone());
        }
        cache.ensure_image(intent.iso_path()).await
    }

    async fn resolve_device(&self, intent: &ProvisionIntent) -> Result<TargetDevice> {
        match intent.device_selector() {
            DeviceSelector::Explicit(path) => {
                let device = self.platform.describe_device(path).await?.ok_or_else(|| {
                    ProvisionError::NoDevice(format!("{} is not a block device on this host", path.display()))
                })?;
                self.platform.validate_device(&device).await?;
                info!("Using {}", device.summary());
                Ok(device)
            }
            DeviceSelector::Auto => {
                let mut valid = Vec::new();
                for device in self.platform.enumerate_devices().await? {
                    match self.platform.validate_device(&device).await {
                        Ok(()) => valid.push(device),
                        Err(e) => info!("Skipping {}: {}", device.path.display(), e),
                    }
                }
                match valid.len() {
                    0 => Err(ProvisionError::NoDevice(
                        "no removable device between 1 GiB and 2 TiB passed validation".to_string(),
                    )),
                    1 => {
                        let device = valid.remove(0);
                        info!("Auto-selected {}", device.summary());
                        Ok(device)
                    }
                    _ => Err(ProvisionError::AmbiguousDevice(valid)),
                }
            }
        }
    }

    async fn confirm(&self, device: &TargetDevice) -> Result<()> {
        let prompt = format!("Erase {} and write the install image?", device.summary());
        if self.confirmer.confirm(&prompt).await? {
            Ok(())
        } else {
            Err(ProvisionError::canceled(format!(
                "{} (operator declined)",
                Phase::AcquireDevice
            )))
        }
    }

    /// Phases 6-9; the caller owns the release and has already begun AcquireDevice
    async fn destructive(
        &self,
        session: &mut ProvisioningSession,
        prepared: &Prepared,
        tracker: &mut DeviceTracker,
        cancel: &CancelToken,
    ) -> Result<Vec<SeedFileEntry>> {
        let device = &prepared.device;
        let platform = &self.platform;

        cancel.check(Subphase::Offline)?;
        with_phase_span(Phase::AcquireDevice.name(), Phase::AcquireDevice.step(), Phase::TOTAL, || {
            platform.offline(device)
        })
        .await?;
        tracker.advance(DeviceState::Offline)?;
        tracker.advance(DeviceState::RawMounted)?;
        self.journal(session, tracker, Phase::AcquireDevice);

        session.begin(Phase::WriteImage);
        cancel.check(Subphase::Write)?;
        info!(
            "Writing {} ({}) to {}",
            prepared.image.path.display(),
            format_size(prepared.image.size_bytes),
            device.path.display()
        );
        with_phase_span(Phase::WriteImage.name(), Phase::WriteImage.step(), Phase::TOTAL, || {
            platform.raw_write(&prepared.image.path, device)
        })
        .await?;
        tracker.advance(DeviceState::ImageWritten)?;
        self.journal(session, tracker, Phase::WriteImage);

        session.begin(Phase::AppendSeedPartition);
        let states = &mut *tracker;
        let partition = with_phase_span(
            Phase::AppendSeedPartition.name(),
            Phase::AppendSeedPartition.step(),
            Phase::TOTAL,
            || async move {
                cancel.check(Subphase::Partition)?;
                let partition = platform
                    .append_partition(
                        device,
                        SEED_PARTITION_NAME,
                        Some(self.settings.seed.seed_partition_mib),
                    )
                    .await?;
                states.advance(DeviceState::Partitioned)?;
                cancel.check(Subphase::Format)?;
                platform.format_fat32(&partition, SEED_VOLUME_LABEL).await?;
                states.advance(DeviceState::Formatted)?;
                Ok::<_, ProvisionError>(partition)
            },
        )
        .await?;
        self.journal(session, tracker, Phase::AppendSeedPartition);

        session.begin(Phase::PlaceSeed);
        let mount_dir = session.mount_dir();
        let listing = with_phase_span(Phase::PlaceSeed.name(), Phase::PlaceSeed.step(), Phase::TOTAL, || {
            self.place_seed(&partition, &mount_dir, &prepared.seed, cancel)
        })
        .await?;
        tracker.advance(DeviceState::Seeded)?;
        self.journal(session, tracker, Phase::PlaceSeed);

        Ok(listing)
    }

    /// Mount, copy, list, unmount; unmount runs whenever the mount succeeded
    async fn place_seed(
        &self,
        partition: &PartitionHandle,
        mount_dir: &Path,
        seed: &SeedBundle,
        cancel: &CancelToken,
    ) -> Result<Vec<SeedFileEntry>> {
        cancel.check(Subphase::Mount)?;
        let mount = self.platform.mount(partition, mount_dir).await?;

        let copied = match cancel.check(Subphase::Copy) {
            Ok(()) => copy_seed(&mount, seed).await,
            Err(e) => Err(e),
        };
        let unmounted = self.platform.unmount(&mount).await;

        let listing = copied?;
        unmounted?;
        Ok(listing)
    }

    /// Phase 10, exactly once; folds the release result into the destructive outcome
    async fn release(
        &self,
        session: &mut ProvisioningSession,
        device: &TargetDevice,
        tracker: &mut DeviceTracker,
        outcome: Result<Vec<SeedFileEntry>>,
    ) -> Result<Vec<SeedFileEntry>> {
        let failed_in = session.phase;
        session.begin(Phase::ReleaseDevice);
        let released = with_phase_span(
            Phase::ReleaseDevice.name(),
            Phase::ReleaseDevice.step(),
            Phase::TOTAL,
            || self.platform.online(device),
        )
        .await
        .and_then(|()| tracker.advance(DeviceState::Online));
        session.device_states = tracker.history().to_vec();

        match (outcome, released) {
            (Ok(listing), Ok(())) => {
                session.complete(Phase::ReleaseDevice);
                Ok(listing)
            }
            (Ok(_), Err(release)) => Err(release),
            (Err(primary), Ok(())) => {
                session.phase = failed_in;
                Err(primary)
            }
            (Err(primary), Err(release)) => {
                session.phase = failed_in;
                Err(ProvisionError::ReleaseFailed {
                    primary: Box::new(primary),
                    release: Box::new(release),
                })
            }
        }
    }

    async fn record(
        &self,
        intent: &ProvisionIntent,
        fingerprints: &Fingerprints,
        overwrite: bool,
    ) -> Result<PathBuf> {
        let record = NodeRecord::provisioned(
            intent.node_name(),
            intent.description(),
            intent.created_by(),
            fingerprints.clone(),
            self.identities.store().dir(),
        );
        self.records.write(&record, overwrite).await
    }

    fn journal(&self, session: &mut ProvisioningSession, tracker: &DeviceTracker, phase: Phase) {
        session.device_states = tracker.history().to_vec();
        session.complete(phase);
    }
}

/// Copy the three seed files onto the mounted partition and list what is there
async fn copy_seed(mount: &MountPoint, seed: &SeedBundle) -> Result<Vec<SeedFileEntry>> {
    let copy_failed = |e: std::io::Error| ProvisionError::platform(Subphase::Copy, e.to_string());

    for (name, contents) in seed.files() {
        let target = mount.path.join(name);
        let mut file = tokio::fs::File::create(&target).await.map_err(copy_failed)?;
        tokio::io::AsyncWriteExt::write_all(&mut file, contents.as_bytes())
            .await
            .map_err(copy_failed)?;
        file.sync_all().await.map_err(copy_failed)?;
    }

    let mut listing = Vec::new();
    let mut entries = tokio::fs::read_dir(&mount.path).await.map_err(copy_failed)?;
    while let Some(entry) = entries.next_entry().await.map_err(copy_failed)? {
        let size_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
        listing.push(SeedFileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            size_bytes,
        });
    }
    listing.sort_by(|a, b| a.name.cmp(&b.name));
    for entry in &listing {
        info!("  {} {}", entry.name, format_size(entry.size_bytes));
    }

    for (name, _) in seed.files() {
        if !listing.iter().any(|e| e.name == name) {
            return Err(ProvisionError::platform(
                Subphase::Copy,
                format!("{} missing from the seed partition after copy", name),
            ));
        }
    }
    Ok(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::fake::{FakeKeygen, FakeTls};
    use crate::identity::IdentityStore;
    use crate::image::fake::FakeFetcher;
    use crate::image::MIN_IMAGE_BYTES;
    use crate::platform::fake::{system_disk, usb_stick, FakePlatform, Injected};
    use crate::platform::{AlwaysConfirm, HostKind};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const GIB: u64 = 1 << 30;
    const RELEASE: ReleaseCandidate = ReleaseCandidate {
        codename: "noble",
        version: "24.04.9",
        url: "https://mirror.invalid/24.04.9/ubuntu-24.04.9-live-server-amd64.iso",
    };

    struct Harness {
        dir: TempDir,
        platform: Arc<FakePlatform>,
        fetcher: Arc<FakeFetcher>,
    }

    impl Harness {
        fn new(platform: FakePlatform) -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                platform: Arc::new(platform),
                fetcher: Arc::new(FakeFetcher::new(vec![RELEASE.url], MIN_IMAGE_BYTES + 1)),
            }
        }

        fn with_fetcher(mut self, fetcher: FakeFetcher) -> Self {
            self.fetcher = Arc::new(fetcher);
            self
        }

        fn pipeline(&self, confirm: bool) -> Pipeline {
            let root = self.dir.path();
            let identities = Arc::new(IdentityManager::new(
                IdentityStore::new(root.join("keys")),
                Arc::new(FakeKeygen::new()),
                Arc::new(FakeTls),
            ));
            Pipeline::new(
                self.platform.clone(),
                identities,
                self.fetcher.clone(),
                NodeRecordWriter::new(root.join("nodes")),
                Arc::new(AlwaysConfirm(confirm)),
                Settings::default(),
            )
            .with_candidates(vec![RELEASE])
        }

        fn defaults(&self) -> IntentDefaults {
            IntentDefaults {
                created_by: "alice".into(),
                work_dir: self.dir.path().join("work"),
                cache_dir: self.dir.path().join("cache"),
            }
        }

        async fn run(&self, request: &IntentRequest) -> std::result::Result<ProvisionReport, SessionFailure> {
            self.pipeline(true)
                .provision(request, &self.defaults(), ProvisionOptions::default(), &CancelToken::new())
                .await
        }
    }

    fn one_stick() -> FakePlatform {
        FakePlatform::new(HostKind::Linux)
            .with_disk(system_disk("/dev/sda", 512 * GIB))
            .with_disk(usb_stick("/dev/sdb", 16 * GIB, "SanDisk Ultra", "4C530001"))
    }

    #[tokio::test]
    async fn test_happy_path_seeds_the_stick() {
        let h = Harness::new(one_stick());

        let report = h.run(&IntentRequest::auto("node-01")).await.unwrap();

        assert_eq!(report.completed, Phase::ALL.to_vec());
        assert_eq!(report.device.path, PathBuf::from("/dev/sdb"));
        assert!(!report.identity_reused);
        assert_eq!(
            h.platform.trace(),
            vec![
                Subphase::Offline,
                Subphase::Write,
                Subphase::Partition,
                Subphase::Format,
                Subphase::Mount,
                Subphase::Unmount,
                Subphase::Online,
            ]
        );

        let disk = h.platform.disk("/dev/sdb").unwrap();
        assert!(!disk.offline);
        let seed = disk.partitions.last().unwrap();
        assert_eq!(seed.number, 3);
        assert_eq!(seed.name, SEED_PARTITION_NAME);
        assert_eq!(seed.label.as_deref(), Some(SEED_VOLUME_LABEL));
        let names: Vec<&str> = seed.files.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["meta-data", "network-config", "user-data"]);
        let meta = String::from_utf8(seed.files["meta-data"].clone()).unwrap();
        assert!(meta.contains(&report.fingerprints.node));

        let record = report.record_path.unwrap();
        assert_eq!(record, h.dir.path().join("nodes/node-01.json"));
        assert!(record.exists());
        assert_eq!(std::fs::read_dir(h.dir.path().join("work")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_second_run_reuses_identity_and_rewrites_record() {
        let h = Harness::new(one_stick());
        let first = h.run(&IntentRequest::auto("node-01")).await.unwrap();

        let second = h.run(&IntentRequest::auto("node-01")).await.unwrap();

        assert!(second.identity_reused);
        assert_eq!(first.fingerprints, second.fingerprints);
        assert!(second.record_warning.is_none());
    }

    #[tokio::test]
    async fn test_ambiguous_devices_touch_nothing() {
        let h = Harness::new(
            one_stick().with_disk(usb_stick("/dev/sdc", 32 * GIB, "Kingston", "KS0002")),
        );

        let failure = h.run(&IntentRequest::auto("node-01")).await.unwrap_err();

        assert_eq!(failure.phase, Phase::ResolveDevice);
        assert_eq!(failure.exit_code(), 3);
        assert!(h.platform.trace().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_system_disk_rejected() {
        let h = Harness::new(one_stick());
        let request = IntentRequest {
            device: Some("/dev/sda".into()),
            ..IntentRequest::auto("node-01")
        };

        let failure = h.run(&request).await.unwrap_err();

        assert_eq!(failure.exit_code(), 4);
        assert_eq!(h.platform.unsafe_writes(), 0);
        assert_eq!(h.platform.count(Subphase::Offline), 0);
    }

    #[tokio::test]
    async fn test_write_failure_releases_once_and_keeps_work_dir() {
        let h = Harness::new(
            one_stick().with_failure(Subphase::Write, Injected::Fail("dd: I/O error".into())),
        );

        let failure = h.run(&IntentRequest::auto("node-01")).await.unwrap_err();

        assert_eq!(failure.phase, Phase::WriteImage);
        assert_eq!(failure.error.subphase(), Some(Subphase::Write));
        assert_eq!(h.platform.count(Subphase::Online), 1);
        assert!(!h.platform.disk("/dev/sdb").unwrap().offline);
        assert!(!h.dir.path().join("nodes/node-01.json").exists());

        let work = failure.work_dir.unwrap();
        let journal = std::fs::read_to_string(work.join(session::JOURNAL_FILE)).unwrap();
        assert!(journal.contains("\"failed\""));
        assert!(journal.contains("WriteImage"));
    }

    #[tokio::test]
    async fn test_release_failure_is_combined() {
        let h = Harness::new(
            one_stick()
                .with_failure(Subphase::Format, Injected::Fail("mkfs.fat missing".into()))
                .with_failure(Subphase::Online, Injected::Fail("busy".into())),
        );

        let failure = h.run(&IntentRequest::auto("node-01")).await.unwrap_err();

        assert_eq!(failure.error.code(), "RELEASE_FAILED");
        assert_eq!(failure.phase, Phase::AppendSeedPartition);
        assert_eq!(h.platform.count(Subphase::Online), 1);
        assert_eq!(failure.report().phase.as_deref(), Some("AppendSeedPartition"));
    }

    #[tokio::test]
    async fn test_declined_confirmation_cancels() {
        let h = Harness::new(one_stick());

        let failure = h
            .pipeline(false)
            .provision(
                &IntentRequest::auto("node-01"),
                &h.defaults(),
                ProvisionOptions::default(),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(failure.error.code(), "CANCELED");
        assert!(h.platform.trace().is_empty());
    }

    #[tokio::test]
    async fn test_force_skips_confirmation() {
        let h = Harness::new(one_stick());
        let options = ProvisionOptions {
            force: true,
            keep_work_dir: true,
            ..Default::default()
        };

        let report = h
            .pipeline(false)
            .provision(&IntentRequest::auto("node-01"), &h.defaults(), options, &CancelToken::new())
            .await
            .unwrap();

        let work = report.work_dir.unwrap();
        assert!(work.join("seed/user-data").exists());
    }

    #[tokio::test]
    async fn test_cancel_before_start_touches_nothing() {
        let h = Harness::new(one_stick());
        let cancel = CancelToken::new();
        cancel.cancel();

        let failure = h
            .pipeline(true)
            .provision(&IntentRequest::auto("node-01"), &h.defaults(), ProvisionOptions::default(), &cancel)
            .await
            .unwrap_err();

        assert_eq!(failure.error.code(), "CANCELED");
        assert_eq!(failure.completed, vec![Phase::ValidateIntent]);
        assert!(h.platform.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_download_stops_at_once() {
        let h = Harness::new(one_stick()).with_fetcher(
            FakeFetcher::new(vec![RELEASE.url], MIN_IMAGE_BYTES + 1).with_delay(Duration::from_secs(30)),
        );
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let fetcher = h.fetcher.clone();
        tokio::spawn(async move {
            while fetcher.fetched().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let failure = h
            .pipeline(true)
            .provision(&IntentRequest::auto("node-01"), &h.defaults(), ProvisionOptions::default(), &cancel)
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(failure.phase, Phase::ResolveImage);
        assert_eq!(failure.error.code(), "CANCELED");
        assert_eq!(h.fetcher.fetched(), vec![RELEASE.url.to_string()]);
        let leftovers: Vec<String> = std::fs::read_dir(h.dir.path().join("cache"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".iso"))
            .collect();
        assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
        assert!(h.platform.trace().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_write_releases_once() {
        let cancel = CancelToken::new();
        let h = Harness::new(one_stick().with_cancel_after(Subphase::Write, cancel.clone()));

        let failure = h
            .pipeline(true)
            .provision(&IntentRequest::auto("node-01"), &h.defaults(), ProvisionOptions::default(), &cancel)
            .await
            .unwrap_err();

        assert_eq!(failure.phase, Phase::AppendSeedPartition);
        assert_eq!(failure.error.code(), "CANCELED");
        assert_eq!(failure.exit_code(), 1);
        assert_eq!(
            h.platform.trace(),
            vec![Subphase::Offline, Subphase::Write, Subphase::Online]
        );
        assert_eq!(h.platform.count(Subphase::Online), 1);
        let disk = h.platform.disk("/dev/sdb").unwrap();
        assert!(!disk.offline);
        assert!(disk.partitions.iter().all(|p| p.name != SEED_PARTITION_NAME));
        assert!(!h.dir.path().join("nodes/node-01.json").exists());
    }

    #[tokio::test]
    async fn test_windows_host_is_unsupported_before_any_work() {
        let h = Harness::new(
            FakePlatform::new(HostKind::Windows)
                .with_disk(usb_stick("PHYSICALDRIVE2", 16 * GIB, "SanDisk", "S1")),
        );

        let failure = h.run(&IntentRequest::auto("node-01")).await.unwrap_err();

        assert_eq!(failure.phase, Phase::ValidateIntent);
        assert_eq!(failure.exit_code(), 7);
        assert!(failure.work_dir.is_none());
        assert!(!h.dir.path().join("work").exists());
    }

    #[tokio::test]
    async fn test_missing_host_tools_stop_before_any_work() {
        let h = Harness::new(one_stick().with_missing_tools(&["sgdisk"]));

        let failure = h.run(&IntentRequest::auto("node-01")).await.unwrap_err();

        assert_eq!(failure.phase, Phase::ValidateIntent);
        assert_eq!(failure.exit_code(), 7);
        assert_eq!(failure.error.code(), "MISSING_TOOLS");
        assert!(failure.error.to_string().contains("sgdisk"));
        assert!(h.platform.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_intent_exit_code() {
        let h = Harness::new(one_stick());

        let failure = h.run(&IntentRequest::auto("x")).await.unwrap_err();

        assert_eq!(failure.exit_code(), 2);
        assert!(h.platform.calls().is_empty());
    }
}
