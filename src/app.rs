//! Command execution for the `tracking-detection` binary.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::{usage_text, version_text, CliCommand, CliInvocation, DEFAULT_REPORT_HOURS};
use crate::domain::models::{BluetoothAddress, Device};
use crate::domain::settings::SettingsService;
use crate::domain::sightings::{SightingOutcome, SightingRecorder};
use crate::infrastructure::bluetooth::backend::BleBackend;
use crate::infrastructure::bluetooth::connection::ConnectionConfig;
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::simulated::SimulatedBackend;
use crate::infrastructure::bluetooth::{BluetoothLeService, SoundOutcome};
use crate::infrastructure::database::Database;

#[cfg(windows)]
fn hardware_backend() -> Result<Arc<dyn BleBackend>> {
    Ok(Arc::new(
        crate::infrastructure::bluetooth::winrt::WinRtBackend::new(),
    ))
}

#[cfg(all(not(windows), feature = "btleplug"))]
fn hardware_backend() -> Result<Arc<dyn BleBackend>> {
    Ok(Arc::new(
        crate::infrastructure::bluetooth::btle::BtleplugBackend::new(),
    ))
}

#[cfg(all(not(windows), not(feature = "btleplug")))]
fn hardware_backend() -> Result<Arc<dyn BleBackend>> {
    anyhow::bail!(
        "No bluetooth backend compiled in. Rebuild with `--features btleplug` or pass --simulate."
    )
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// `now` moved back by `delta`, or an error when either step overflows
fn before(now: NaiveDateTime, delta: Option<ChronoDuration>, what: &str) -> Result<NaiveDateTime> {
    delta
        .and_then(|delta| now.checked_sub_signed(delta))
        .ok_or_else(|| anyhow::anyhow!("{} is out of range", what))
}

/// Stored form of a user-supplied address
fn normalize_address(raw: &str) -> Result<String> {
    let address: BluetoothAddress = raw.parse()?;
    Ok(address.to_string())
}

pub struct App<'a> {
    settings: &'a SettingsService,
    db_path: PathBuf,
    simulate: bool,
}

impl<'a> App<'a> {
    pub fn new(settings: &'a SettingsService, invocation: &CliInvocation) -> Self {
        Self {
            settings,
            db_path: invocation
                .db_path
                .clone()
                .unwrap_or_else(|| settings.database_path()),
            simulate: invocation.simulate,
        }
    }

    fn backend(&self) -> Result<Arc<dyn BleBackend>> {
        if self.simulate {
            info!("Using simulated bluetooth backend");
            return Ok(Arc::new(SimulatedBackend::demo()));
        }
        hardware_backend()
    }

    fn open_db(&self) -> Result<Database> {
        Database::open(&self.db_path)
            .with_context(|| format!("Failed to open database {}", self.db_path.display()))
    }

    pub async fn run(&self, command: CliCommand) -> Result<()> {
        match command {
            CliCommand::Help => println!("{}", usage_text()),
            CliCommand::Version => println!("{}", version_text()),
            CliCommand::Scan { seconds } => self.scan(seconds).await?,
            CliCommand::List { ignored } => self.list(ignored)?,
            CliCommand::Ignore { address } => {
                let address = normalize_address(&address)?;
                let changed = self.open_db()?.device_dao().ignore(&address)?;
                report_change(changed, &address, "ignored");
            }
            CliCommand::Unignore { address } => {
                let address = normalize_address(&address)?;
                let changed = self.open_db()?.device_dao().un_ignore(&address)?;
                report_change(changed, &address, "no longer ignored");
            }
            CliCommand::Remove { address } => {
                let address = normalize_address(&address)?;
                let changed = self.open_db()?.device_dao().remove(&address)?;
                report_change(changed, &address, "removed");
            }
            CliCommand::Stats => self.stats().await?,
            CliCommand::Report { since_hours } => self.report(since_hours)?,
            CliCommand::PlaySound { address } => self.play_sound(&address).await?,
            CliCommand::Prune => self.prune()?,
        }
        Ok(())
    }

    async fn scan(&self, seconds: Option<u64>) -> Result<()> {
        let settings = self.settings.get();
        let seconds = seconds.unwrap_or(settings.scan_duration_secs);
        let db = self.open_db()?;

        let backend = self.backend()?;
        let adapter = backend
            .default_adapter()
            .await
            .context("Bluetooth adapter is not available")?;
        let mut scanner = BleScanner::new(adapter, settings.show_all_devices);

        println!("Scanning for {} seconds...", seconds);
        let found = scanner.scan_for(Duration::from_secs(seconds)).await?;

        let recorder = SightingRecorder::new(&db);
        let seen_at = now();
        let mut new_devices = 0;
        let mut ignored = 0;
        for device in &found {
            match recorder.record(device, seen_at)? {
                SightingOutcome::NewDevice => new_devices += 1,
                SightingOutcome::KnownDevice { ignored: true } => ignored += 1,
                SightingOutcome::KnownDevice { ignored: false } => {}
            }
        }

        info!(
            advertisements = found.len(),
            new_devices, ignored, "Scan recorded"
        );
        println!(
            "{} advertisements, {} new devices, {} from ignored devices",
            found.len(),
            new_devices,
            ignored
        );
        Ok(())
    }

    fn list(&self, ignored_only: bool) -> Result<()> {
        let dao = self.open_db()?.device_dao();
        let devices = if ignored_only { dao.ignored()? } else { dao.all()? };

        if devices.is_empty() {
            println!("No devices.");
            return Ok(());
        }
        for device in &devices {
            println!("{}", format_device(device));
        }
        Ok(())
    }

    async fn stats(&self) -> Result<()> {
        let settings = self.settings.get();
        let dao = self.open_db()?.device_dao();
        let now = now();
        let window = before(
            now,
            ChronoDuration::try_minutes(settings.monitoring_window_minutes),
            "monitoring_window_minutes",
        )?;
        let day = before(
            now,
            ChronoDuration::try_hours(DEFAULT_REPORT_HOURS as i64),
            "report window",
        )?;

        let total = first(dao.watch_total_count()).await?;
        let new = first(dao.watch_total_count_change(day)).await?;
        let monitored = first(dao.watch_currently_monitored(window)).await?;

        println!("Total devices:        {}", total);
        println!("New in last {}h:      {}", DEFAULT_REPORT_HOURS, new);
        println!(
            "Seen in last {} min:  {}",
            settings.monitoring_window_minutes, monitored
        );
        Ok(())
    }

    fn report(&self, since_hours: u64) -> Result<()> {
        let hours = i64::try_from(since_hours)
            .ok()
            .and_then(ChronoDuration::try_hours);
        let since = before(now(), hours, "--since-hours")?;
        let report = self.open_db()?.device_dao().device_beacons_since(since)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }

    async fn play_sound(&self, address: &str) -> Result<()> {
        let settings = self.settings.get();
        let config =
            ConnectionConfig::from_settings(settings).context("Invalid sound UUID in settings")?;
        let mut service = BluetoothLeService::new(self.backend()?, config);

        let outcome = service
            .play_sound(address, Duration::from_secs(settings.sound_timeout_secs))
            .await;
        match outcome {
            SoundOutcome::Completed => println!("Sound played on {}", address),
            SoundOutcome::Failed => anyhow::bail!("Playing sound on {} failed", address),
            SoundOutcome::TimedOut => anyhow::bail!("No answer from {} in time", address),
            SoundOutcome::NotStarted => anyhow::bail!("Could not connect to {}", address),
        }
        Ok(())
    }

    fn prune(&self) -> Result<()> {
        let days = self.settings.get().beacon_retention_days;
        let cutoff = before(now(), ChronoDuration::try_days(days), "beacon_retention_days")?;
        let deleted = self.open_db()?.beacon_dao().delete_older_than(cutoff)?;
        println!("Deleted {} beacons older than {} days", deleted, days);
        Ok(())
    }
}

async fn first<T>(
    mut stream: futures::stream::BoxStream<'static, crate::error::StoreResult<T>>,
) -> Result<T> {
    match stream.next().await {
        Some(value) => Ok(value?),
        None => anyhow::bail!("Query stream ended without a value"),
    }
}

fn report_change(changed: usize, address: &str, what: &str) {
    if changed == 0 {
        warn!(address, "No stored device matched");
        println!("No device {}", address);
    } else {
        println!("{} {}", address, what);
    }
}

fn format_device(device: &Device) -> String {
    format!(
        "{:<17}  {:<16}  last seen {}  {}{}",
        device.address,
        device.name.as_deref().unwrap_or("-"),
        device.last_seen.format("%Y-%m-%d %H:%M"),
        if device.ignore { "[ignored] " } else { "" },
        device
            .payload_data
            .map(|p| format!("status 0x{:02X}", p))
            .unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::parse_cli_args;

    fn app_for(dir: &tempfile::TempDir, args: &[&str]) -> (SettingsService, CliInvocation) {
        let settings = SettingsService::with_path(dir.path().join("settings.json"));
        let db = dir.path().join("devices.db");
        let db = db.to_string_lossy().into_owned();
        let mut full = vec!["tracking-detection", "--simulate", "--db", db.as_str()];
        full.extend_from_slice(args);
        let invocation = parse_cli_args(full).unwrap();
        (settings, invocation)
    }

    async fn run(dir: &tempfile::TempDir, args: &[&str]) -> Result<()> {
        let (settings, invocation) = app_for(dir, args);
        let app = App::new(&settings, &invocation);
        app.run(invocation.command).await
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address("d4:1a:7c:22:90:01").unwrap(),
            "D4:1A:7C:22:90:01"
        );
        assert!(normalize_address("D4:1A").is_err());
    }

    #[tokio::test]
    async fn test_simulated_scan_then_ignore() {
        let dir = tempfile::tempdir().unwrap();
        run(&dir, &["scan", "--seconds", "1"]).await.unwrap();

        let db = Database::open(dir.path().join("devices.db")).unwrap();
        let devices = db.device_dao().all().unwrap();
        assert_eq!(devices.len(), 2);

        run(&dir, &["ignore", "d4:1a:7c:22:90:01"]).await.unwrap();
        let ignored = db.device_dao().ignored().unwrap();
        assert_eq!(ignored.len(), 1);
        assert_eq!(ignored[0].address, "D4:1A:7C:22:90:01");

        run(&dir, &["stats"]).await.unwrap();
        run(&dir, &["report"]).await.unwrap();
        run(&dir, &["prune"]).await.unwrap();
    }

    #[tokio::test]
    async fn test_simulated_play_sound() {
        let dir = tempfile::tempdir().unwrap();
        run(&dir, &["play-sound", "D4:1A:7C:22:90:01"]).await.unwrap();
        assert!(run(&dir, &["play-sound", "00:00:00:00:00:00"]).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_window_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&dir, &["report", "--since-hours", "10000000000"])
            .await
            .is_err());
        assert!(run(&dir, &["report", "--since-hours", "18446744073709551615"])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_oversized_settings_window_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut settings, invocation) = app_for(&dir, &["prune"]);
        settings.get_mut().beacon_retention_days = i64::MAX;
        settings.get_mut().monitoring_window_minutes = i64::MAX;
        let app = App::new(&settings, &invocation);
        assert!(app.run(CliCommand::Prune).await.is_err());
        assert!(app.run(CliCommand::Stats).await.is_err());
    }

    #[test]
    fn test_before_checks_overflow() {
        let now = chrono::NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(
            before(now, ChronoDuration::try_hours(24), "x").unwrap(),
            now - ChronoDuration::days(1)
        );
        assert!(before(now, None, "x").is_err());
        assert!(before(now, ChronoDuration::try_days(i64::MAX / 86_400), "x").is_err());
    }

    #[test]
    fn test_format_device() {
        let seen = chrono::NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 0)
            .unwrap();
        let mut device = Device::new("AA:BB:CC:DD:EE:FF", seen);
        device.ignore = true;
        device.payload_data = Some(0x10);
        let line = format_device(&device);
        assert!(line.contains("AA:BB:CC:DD:EE:FF"));
        assert!(line.contains("2024-01-02 03:04"));
        assert!(line.contains("[ignored]"));
        assert!(line.contains("status 0x10"));
    }
}
