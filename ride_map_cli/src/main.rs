use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::SecondsFormat;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use rayon::prelude::*;
use ride_map::{
    aggregate_history, points_in_band, spawn_watch, AlertBatch, AlertSink, AlertZone, BandTable,
    HazardPoint, HazardStore, IngestBatch, JsonlStore, LatLng, PipelineConfig, PositionError,
    PositionUpdate, RangeFilter, RmError, Sample,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ride comfort map tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Aggregate recorded ingestion batches into hazard points
    Aggregate(AggregateArgs),
    /// Re-run aggregation over the raw history kept in a store
    Reprocess(ReprocessArgs),
    /// Query a store by severity band or range filter
    Query(QueryArgs),
    /// Print the configured severity bands
    Bands(BandsArgs),
    /// Replay a position track through the geofence watcher
    Watch(WatchArgs),
}

#[derive(Copy, Clone, Debug, ValueEnum, PartialEq, Eq)]
enum OutputFormat {
    Csv,
    Json,
}

#[derive(Parser, Debug)]
struct AggregateArgs {
    /// Batch files (`{"sessionId", "payload"}` or an array of them)
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,

    /// Also persist samples and points into this store directory
    #[arg(long, value_hint = ValueHint::DirPath)]
    store: Option<PathBuf>,

    /// Pipeline configuration (JSON)
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ReprocessArgs {
    /// Store directory holding the raw history
    #[arg(long, value_hint = ValueHint::DirPath)]
    store: PathBuf,

    /// Sessions to reprocess
    #[arg(long = "session", required = true)]
    sessions: Vec<String>,

    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,

    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct QueryArgs {
    /// Store directory to query
    #[arg(long, value_hint = ValueHint::DirPath)]
    store: PathBuf,

    /// Severity band name
    #[arg(long, conflicts_with = "filter")]
    band: Option<String>,

    /// Range filter in wire form, e.g. '{"verticalVibration": {"gt": 1.0}}'
    #[arg(long)]
    filter: Option<String>,

    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,

    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct BandsArgs {
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct WatchArgs {
    /// Zones from the points of a severity band in this store
    #[arg(long, value_hint = ValueHint::DirPath, requires = "band")]
    store: Option<PathBuf>,

    /// Band whose points become alert zones
    #[arg(long)]
    band: Option<String>,

    /// Zones from a JSON array of `{"center", "radius", "label"}`
    #[arg(long, value_hint = ValueHint::FilePath, conflicts_with = "store")]
    zones: Option<PathBuf>,

    /// Zone radius in meters where none is given (defaults to the configured radius)
    #[arg(long)]
    radius: Option<f64>,

    /// GPX track to replay
    #[arg(long, value_hint = ValueHint::FilePath, conflicts_with = "positions")]
    track: Option<PathBuf>,

    /// Positions to replay, one `{"latitude", "longitude"}` per line
    #[arg(long, value_hint = ValueHint::FilePath)]
    positions: Option<PathBuf>,

    /// Pause between fixes in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

impl Command {
    fn verbose(&self) -> bool {
        match self {
            Command::Aggregate(args) => args.verbose,
            Command::Reprocess(args) => args.verbose,
            Command::Query(args) => args.verbose,
            Command::Bands(args) => args.verbose,
            Command::Watch(args) => args.verbose,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.command.verbose() {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Aggregate(args) => handle_aggregate(args),
        Command::Reprocess(args) => handle_reprocess(args),
        Command::Query(args) => handle_query(args),
        Command::Bands(args) => handle_bands(args),
        Command::Watch(args) => handle_watch(args),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    PipelineConfig::load_or_default(path).context("failed to load configuration")
}

fn open_store(dir: &Path) -> Result<JsonlStore> {
    JsonlStore::open(dir).with_context(|| format!("failed to open store at {}", dir.display()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchFile {
    Many(Vec<IngestBatch>),
    One(IngestBatch),
}

fn read_batches(path: &Path) -> Result<Vec<Sample>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let batches = match serde_json::from_str::<BatchFile>(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?
    {
        BatchFile::Many(batches) => batches,
        BatchFile::One(batch) => vec![batch],
    };
    let mut samples = Vec::new();
    for batch in batches {
        samples.extend(
            batch
                .into_samples()
                .with_context(|| format!("invalid batch in {}", path.display()))?,
        );
    }
    Ok(samples)
}

fn handle_aggregate(args: AggregateArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;

    let per_file: Vec<Vec<Sample>> = args
        .inputs
        .par_iter()
        .map(|path| read_batches(path))
        .collect::<Result<Vec<_>>>()?;
    let samples: Vec<Sample> = per_file.into_iter().flatten().collect();
    info!(
        files = args.inputs.len(),
        samples = samples.len(),
        "recorded batches loaded"
    );

    let store = args.store.as_deref().map(open_store).transpose()?;
    if let Some(store) = store.as_ref() {
        store.append_samples(&samples)?;
    }

    let sessions = aggregate_history(samples, &config.window)?;
    if let Some(store) = store.as_ref() {
        for points in sessions.values() {
            store.put_all(points)?;
        }
        info!(store = %store.root().display(), "points persisted");
    }

    let rows = session_rows(&sessions, &config.bands);
    info!(
        sessions = sessions.len(),
        points = rows.len(),
        "aggregation finished"
    );
    write_rows(&rows, &args.output, args.format)
}

fn handle_reprocess(args: ReprocessArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let store = open_store(&args.store)?;

    let mut samples = Vec::new();
    for session in &args.sessions {
        let history = store.session_samples(session)?;
        if history.is_empty() {
            warn!(session = %session, "no raw history stored for session");
        }
        samples.extend(history);
    }
    let sessions = aggregate_history(samples, &config.window)?;
    let rows = session_rows(&sessions, &config.bands);
    info!(
        sessions = sessions.len(),
        points = rows.len(),
        "reprocessing finished"
    );
    write_rows(&rows, &args.output, args.format)
}

fn build_filter(
    band: Option<&str>,
    filter: Option<&str>,
    bands: &BandTable,
) -> Result<RangeFilter> {
    match (band, filter) {
        (Some(name), _) => Ok(bands.classify(name)?),
        (None, Some(text)) => serde_json::from_str(text).context("invalid --filter"),
        (None, None) => Ok(RangeFilter::all()),
    }
}

fn handle_query(args: QueryArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let store = open_store(&args.store)?;
    let filter = build_filter(args.band.as_deref(), args.filter.as_deref(), &config.bands)?;

    let rows: Vec<PointRow> = store
        .query(&filter)?
        .map(|point| PointRow::new(None, &point, &config.bands))
        .collect();
    info!(matches = rows.len(), "query finished");
    write_rows(&rows, &args.output, args.format)
}

fn handle_bands(args: BandsArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    for band in config.bands.iter() {
        writeln!(handle, "{band}")?;
    }
    Ok(())
}

#[derive(Debug, Serialize, PartialEq)]
struct PointRow {
    session_id: Option<String>,
    time: i64,
    latitude: f64,
    longitude: f64,
    vertical_vibration: f64,
    microphone: Option<f64>,
    band: String,
}

impl PointRow {
    fn new(session_id: Option<&str>, point: &HazardPoint, bands: &BandTable) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            time: point.time,
            latitude: point.latitude,
            longitude: point.longitude,
            vertical_vibration: point.vertical_vibration,
            microphone: point.microphone,
            band: bands.band_of(point.vertical_vibration).join(";"),
        }
    }
}

fn session_rows(
    sessions: &std::collections::BTreeMap<String, Vec<HazardPoint>>,
    bands: &BandTable,
) -> Vec<PointRow> {
    sessions
        .iter()
        .flat_map(|(session, points)| {
            points
                .iter()
                .map(move |point| PointRow::new(Some(session), point, bands))
        })
        .collect()
}

fn write_rows(rows: &[PointRow], output: &Path, format: OutputFormat) -> Result<()> {
    if output.as_os_str() == "-" {
        let stdout = io::stdout();
        write_rows_to(rows, stdout.lock(), format)
    } else {
        let file = File::create(output)
            .with_context(|| format!("failed to create {}", output.display()))?;
        write_rows_to(rows, file, format)?;
        info!(path = %output.display(), "output written");
        Ok(())
    }
}

fn write_rows_to<W: Write>(rows: &[PointRow], mut out: W, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(out);
            for row in rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut out, rows)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

fn zones_from_band(
    store: &dyn HazardStore,
    bands: &BandTable,
    band: &str,
    radius: f64,
) -> Result<Vec<AlertZone>> {
    Ok(points_in_band(store, bands, band)?
        .map(|point| AlertZone::from_point(&point, radius).with_label(format!("{band} spot")))
        .collect())
}

#[derive(Deserialize)]
struct ZoneEntry {
    center: LatLng,
    #[serde(default)]
    radius: Option<f64>,
    #[serde(default)]
    label: Option<String>,
}

/// Zones without a radius take `default_radius`.
fn read_zones(path: &Path, default_radius: f64) -> Result<Vec<AlertZone>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let entries: Vec<ZoneEntry> = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse zones in {}", path.display()))?;
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| -> Result<AlertZone> {
            let zone = AlertZone {
                center: entry.center,
                radius: entry.radius.unwrap_or(default_radius),
                label: entry.label,
            };
            zone.validate()
                .with_context(|| format!("bad zone {index} in {}", path.display()))?;
            Ok(zone)
        })
        .collect()
}

fn parse_track(path: &Path) -> Result<Vec<PositionUpdate>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let gpx = gpx::read(BufReader::new(file))
        .map_err(|e| anyhow!("failed to parse {}: {e}", path.display()))?;
    let mut out = Vec::new();
    for track in gpx.tracks {
        for segment in track.segments {
            for point in segment.points {
                let geo = point.point();
                out.push(PositionUpdate::Fix(LatLng::new(geo.y(), geo.x())));
            }
        }
    }
    Ok(out)
}

/// Unparseable lines become feed errors so the replay mirrors a flaky receiver.
fn read_positions(path: &Path) -> Result<Vec<PositionUpdate>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut out = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let update = serde_json::from_str::<LatLng>(&line)
            .map_err(|e| RmError::invalid(e.to_string()))
            .and_then(|fix| fix.validate().map(|_| fix));
        out.push(match update {
            Ok(fix) => PositionUpdate::Fix(fix),
            Err(err) => PositionUpdate::Error(PositionError::Unavailable(format!(
                "line {}: {err}",
                index + 1
            ))),
        });
    }
    Ok(out)
}

/// Prints each batch to stdout and rings the terminal bell for the sound.
#[derive(Default)]
struct ConsoleSink {
    delivered: AtomicUsize,
}

impl AlertSink for ConsoleSink {
    fn notify(&self, batch: &AlertBatch) -> Result<(), RmError> {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        let stamp = batch.raised_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        for line in batch.message().lines() {
            writeln!(handle, "[{stamp}] {line}")
                .map_err(|e| RmError::AlertDelivery(e.to_string()))?;
        }
        Ok(())
    }

    fn play_sound(&self, _batch: &AlertBatch) -> Result<(), RmError> {
        let mut stderr = io::stderr();
        stderr
            .write_all(b"\x07")
            .and_then(|_| stderr.flush())
            .map_err(|e| RmError::AlertDelivery(e.to_string()))
    }
}

fn handle_watch(args: WatchArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let radius = args.radius.unwrap_or(config.alerts.default_radius_m);
    if !radius.is_finite() || radius < 0.0 {
        bail!("--radius must be a non-negative distance");
    }

    let zones = match (&args.zones, &args.store, &args.band) {
        (Some(path), _, _) => read_zones(path, radius)?,
        (None, Some(dir), Some(band)) => {
            zones_from_band(&open_store(dir)?, &config.bands, band, radius)?
        }
        _ => bail!("supply --zones FILE or --store DIR --band NAME"),
    };
    let updates = match (&args.track, &args.positions) {
        (Some(path), _) => parse_track(path)?,
        (None, Some(path)) => read_positions(path)?,
        (None, None) => bail!("supply --track FILE.gpx or --positions FILE"),
    };
    info!(
        zones = zones.len(),
        updates = updates.len(),
        "replaying positions"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let sink = Arc::new(ConsoleSink::default());
    let interval = Duration::from_millis(args.interval_ms);
    let alerts = config.alerts.clone();

    let state = runtime.block_on({
        let sink = Arc::clone(&sink);
        async move {
            let (tx, rx) = mpsc::channel(16);
            let drain = alerts.batch_delay() * 2;
            let handle = spawn_watch(rx, zones, alerts, sink);
            for update in updates {
                if tx.send(update).await.is_err() {
                    warn!("watcher stopped before the replay finished");
                    break;
                }
                tokio::time::sleep(interval).await;
            }
            drop(tx);
            let state = handle.finished().await;
            // let the last debounced deliveries land
            tokio::time::sleep(drain).await;
            state
        }
    });

    info!(
        batches = sink.delivered.load(Ordering::Relaxed),
        zones_alerted = state.len(),
        "replay finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ride_map::MemoryStore;

    fn point(vv: f64) -> HazardPoint {
        HazardPoint {
            latitude: 35.0,
            longitude: 139.0,
            time: 7,
            vertical_vibration: vv,
            vibration: None,
            microphone: Some(0.5),
        }
    }

    #[test]
    fn reads_single_and_multiple_batch_files() {
        let dir = tempfile::tempdir().unwrap();
        let one = dir.path().join("one.json");
        fs::write(
            &one,
            r#"{"sessionId": "A", "payload": [
                {"name": "accelerometer", "time": 1000, "values": {"x": 0, "y": 0, "z": 3}},
                {"name": "location", "time": 2000, "values": {"latitude": 35.0, "longitude": 139.0}}
            ]}"#,
        )
        .unwrap();
        let many = dir.path().join("many.json");
        fs::write(
            &many,
            r#"[{"sessionId": "B", "payload": []},
                {"sessionId": "C", "payload": [{"name": "microphone", "time": 0, "values": {"dBFS": -3}}]}]"#,
        )
        .unwrap();

        let samples = read_batches(&one).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].time, 2);
        let samples = read_batches(&many).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].session_id, "C");

        let bad = dir.path().join("bad.json");
        fs::write(
            &bad,
            r#"{"sessionId": "A", "payload": [{"name": "gyro", "time": 0, "values": {}}]}"#,
        )
        .unwrap();
        assert!(read_batches(&bad).is_err());
    }

    #[test]
    fn rows_carry_band_labels() {
        let bands = BandTable::default();
        let row = PointRow::new(Some("S"), &point(1.2), &bands);
        assert_eq!(row.band, "uncomfortable");
        assert_eq!(row.session_id.as_deref(), Some("S"));

        let mut buf = Vec::new();
        write_rows_to(&[row], &mut buf, OutputFormat::Csv).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("session_id,time,latitude,longitude,vertical_vibration,microphone,band")
        );
        assert_eq!(lines.next(), Some("S,7,35.0,139.0,1.2,0.5,uncomfortable"));
    }

    #[test]
    fn filter_comes_from_band_or_wire_form() {
        let bands = BandTable::default();
        let by_band = build_filter(Some("uncomfortable"), None, &bands).unwrap();
        assert!(by_band.matches(&point(1.6)));
        assert!(!by_band.matches(&point(1.0)));

        let wire_text = r#"{"verticalVibration": {"$gt": 2.0}}"#;
        let wire = build_filter(None, Some(wire_text), &bands).unwrap();
        assert!(wire.matches(&point(2.1)));
        assert!(build_filter(None, Some(r#"{"speed": {"gt": 1}}"#), &bands).is_err());
        assert!(build_filter(Some("nope"), None, &bands).is_err());
        assert!(build_filter(None, None, &bands).unwrap().matches(&point(0.0)));
    }

    #[test]
    fn band_points_become_labelled_zones() {
        let store = MemoryStore::default();
        store.put(point(3.0)).unwrap();
        store.put(point(0.1)).unwrap();
        let bands = BandTable::default();
        let zones = zones_from_band(&store, &bands, "extremely-uncomfortable", 15.0).unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].radius, 15.0);
        assert_eq!(zones[0].label.as_deref(), Some("extremely-uncomfortable spot"));
    }

    #[test]
    fn position_lines_map_to_fixes_and_feed_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"latitude": 35.0, "longitude": 139.0}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "garbage").unwrap();
        writeln!(file, r#"{{"latitude": 95.0, "longitude": 139.0}}"#).unwrap();
        let updates = read_positions(file.path()).unwrap();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0], PositionUpdate::Fix(LatLng::new(35.0, 139.0)));
        assert!(matches!(
            updates[1],
            PositionUpdate::Error(PositionError::Unavailable(_))
        ));
        assert!(matches!(updates[2], PositionUpdate::Error(_)));
    }

    #[test]
    fn gpx_track_points_become_fixes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <trk><trkseg>
    <trkpt lat="35.0" lon="139.0"></trkpt>
    <trkpt lat="35.0001" lon="139.0002"></trkpt>
  </trkseg></trk>
</gpx>"#
        )
        .unwrap();
        let updates = parse_track(file.path()).unwrap();
        assert_eq!(
            updates,
            vec![
                PositionUpdate::Fix(LatLng::new(35.0, 139.0)),
                PositionUpdate::Fix(LatLng::new(35.0001, 139.0002)),
            ]
        );
    }

    #[test]
    fn zones_file_is_validated() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"center": {{"latitude": 35.0, "longitude": 139.0}}, "label": "gate"}},
                {{"center": {{"latitude": 35.1, "longitude": 139.0}}, "radius": 4.0}}]"#
        )
        .unwrap();
        let zones = read_zones(file.path(), 25.0).unwrap();
        assert_eq!(zones[0].label.as_deref(), Some("gate"));
        assert_eq!(zones[0].radius, 25.0);
        assert_eq!(zones[1].radius, 4.0);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, r#"[{{"center": {{"latitude": 135.0, "longitude": 0.0}}}}]"#).unwrap();
        assert!(read_zones(bad.path(), 10.0).is_err());

        let mut negative = tempfile::NamedTempFile::new().unwrap();
        write!(
            negative,
            r#"[{{"center": {{"latitude": 35.0, "longitude": 0.0}}, "radius": -1.0}}]"#
        )
        .unwrap();
        assert!(read_zones(negative.path(), 10.0).is_err());
    }
}
