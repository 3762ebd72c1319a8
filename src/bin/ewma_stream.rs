//! ewma-stream - run the EWMA detector over a synthetic or recorded stream
//!
//! Usage:
//!   ewma-stream simulate --samples 2000 --seed 7
//!   ewma-stream replay --input readings.csv --alpha 0.3 --k 3
//!   cat values.txt | ewma-stream replay --format pretty --anomalies-only

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ewma_stream::config::AppConfig;
use ewma_stream::generator::{GeneratorConfig, StreamGenerator};
use ewma_stream::{DetectorConfig, DeviationEstimator, Observation, StreamAnomalyDetector, Verdict};

#[derive(Parser)]
#[command(name = "ewma-stream")]
#[command(about = "Real-time EWMA anomaly detection with a dynamic threshold")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect anomalies in a generated stream with injected spikes
    Simulate {
        /// Number of samples to generate
        #[arg(short = 'n', long, default_value = "1000")]
        samples: usize,

        /// RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Base signal level
        #[arg(long, default_value = "100")]
        base: f64,

        /// Standard deviation of the Gaussian noise
        #[arg(long, default_value = "10")]
        noise: f64,

        /// Level change per sample
        #[arg(long, default_value = "0")]
        drift: f64,

        /// Probability of a spike per sample
        #[arg(long, default_value = "0.05")]
        spike_probability: f64,

        #[command(flatten)]
        detector: DetectorArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Detect anomalies in recorded values, one `value` or `timestamp,value` per line
    Replay {
        /// Input file (stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        #[command(flatten)]
        detector: DetectorArgs,

        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(Args)]
struct DetectorArgs {
    /// JSON config file; only its `detector` section is used
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Smoothing factor in (0, 1]
    #[arg(long)]
    alpha: Option<f64>,

    /// Threshold multiplier
    #[arg(short, long)]
    k: Option<f64>,

    /// Warm-up samples before classification starts
    #[arg(short, long)]
    warmup: Option<u32>,

    /// Spread estimator
    #[arg(long)]
    estimator: Option<EstimatorArg>,
}

impl DetectorArgs {
    fn resolve(&self) -> Result<DetectorConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?.detector,
            None => DetectorConfig::default(),
        };
        if let Some(alpha) = self.alpha {
            config.alpha = alpha;
        }
        if let Some(k) = self.k {
            config.k = k;
        }
        if let Some(warmup) = self.warmup {
            config.warmup_count = warmup;
        }
        if let Some(estimator) = self.estimator {
            config.estimator = estimator.into();
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum EstimatorArg {
    Absolute,
    StdDev,
}

impl From<EstimatorArg> for DeviationEstimator {
    fn from(arg: EstimatorArg) -> Self {
        match arg {
            EstimatorArg::Absolute => DeviationEstimator::AbsoluteDeviation,
            EstimatorArg::StdDev => DeviationEstimator::StdDev,
        }
    }
}

#[derive(Args)]
struct OutputArgs {
    /// Output format
    #[arg(short, long, default_value = "json-lines")]
    format: OutputFormat,

    /// Only print anomalous samples
    #[arg(long)]
    anomalies_only: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    JsonLines,
    Pretty,
}

#[derive(Serialize)]
struct VerdictRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<u64>,
    value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    injected_spike: Option<bool>,
    #[serde(flatten)]
    verdict: Verdict,
}

struct VerdictWriter<W: Write> {
    out: W,
    format: OutputFormat,
    anomalies_only: bool,
    header_written: bool,
}

impl<W: Write> VerdictWriter<W> {
    fn new(out: W, args: &OutputArgs) -> Self {
        Self {
            out,
            format: args.format,
            anomalies_only: args.anomalies_only,
            header_written: false,
        }
    }

    fn write(&mut self, record: &VerdictRecord) -> io::Result<()> {
        if self.anomalies_only && !record.verdict.is_anomaly {
            return Ok(());
        }
        match self.format {
            OutputFormat::JsonLines => {
                serde_json::to_writer(&mut self.out, record)?;
                writeln!(self.out)
            }
            OutputFormat::Pretty => {
                if !self.header_written {
                    writeln!(
                        self.out,
                        "{:>10} {:>12} {:>12} {:>12} {:>12}  {}",
                        "t", "value", "mean", "threshold", "deviation", "verdict"
                    )?;
                    self.header_written = true;
                }
                let t = record
                    .timestamp
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let label = if record.verdict.is_anomaly {
                    "ANOMALY"
                } else if record.verdict.phase == ewma_stream::Phase::Warming {
                    "warming"
                } else {
                    "ok"
                };
                writeln!(
                    self.out,
                    "{:>10} {:>12.4} {:>12.4} {:>12.4} {:>12.4}  {}",
                    t,
                    record.value,
                    record.verdict.mean,
                    record.verdict.threshold,
                    record.verdict.deviation,
                    label
                )
            }
        }
    }

    fn finish(mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Parse `value` or `timestamp,value`. Blank lines and `#` comments yield `None`.
fn parse_line(line: &str) -> Result<Option<Observation>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let parse_value = |raw: &str| {
        raw.trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid value {:?}: {}", raw.trim(), e))
    };

    match line.split_once(',') {
        Some((ts, value)) => {
            let timestamp = ts
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid timestamp {:?}: {}", ts.trim(), e))?;
            Ok(Some(Observation::at(timestamp, parse_value(value)?)))
        }
        None => Ok(Some(Observation::new(parse_value(line)?))),
    }
}

fn run_simulate(
    generator_config: GeneratorConfig,
    samples: usize,
    detector_config: DetectorConfig,
    output: &OutputArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut detector = StreamAnomalyDetector::new(detector_config)?;
    let generator = StreamGenerator::new(generator_config)?;
    let mut writer = VerdictWriter::new(BufWriter::new(io::stdout().lock()), output);

    let (mut flagged, mut spikes, mut caught) = (0usize, 0usize, 0usize);
    for sample in generator.take(samples) {
        let verdict = detector.observe_at(sample.observation)?;
        if verdict.is_anomaly {
            flagged += 1;
            warn!(
                t = sample.observation.timestamp,
                value = sample.observation.value,
                mean = verdict.mean,
                threshold = verdict.threshold,
                "Anomaly detected"
            );
        }
        if sample.is_injected_spike {
            spikes += 1;
            if verdict.is_anomaly {
                caught += 1;
            }
        }
        writer.write(&VerdictRecord {
            timestamp: sample.observation.timestamp,
            value: sample.observation.value,
            injected_spike: Some(sample.is_injected_spike),
            verdict,
        })?;
    }
    writer.finish()?;

    info!(
        samples,
        flagged,
        injected_spikes = spikes,
        spikes_flagged = caught,
        "Simulation complete"
    );
    Ok(())
}

#[derive(Debug, Default, PartialEq)]
struct ReplayStats {
    processed: usize,
    flagged: usize,
    skipped: usize,
}

/// Feed every line of `reader` through `detector`. Lines that are not UTF-8,
/// do not parse, or are rejected by the detector are logged and skipped.
fn replay<R: BufRead, W: Write>(
    mut reader: R,
    detector: &mut StreamAnomalyDetector,
    writer: &mut VerdictWriter<W>,
) -> io::Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim_end_matches(['\n', '\r']),
            Err(e) => {
                stats.skipped += 1;
                warn!(line = line_no, error = %e, "Skipping line that is not valid UTF-8");
                continue;
            }
        };

        let observation = match parse_line(line) {
            Ok(Some(observation)) => observation,
            Ok(None) => continue,
            Err(reason) => {
                stats.skipped += 1;
                warn!(line = line_no, %reason, "Skipping unparsable line");
                continue;
            }
        };

        let verdict = match detector.observe_at(observation) {
            Ok(verdict) => verdict,
            Err(e) => {
                stats.skipped += 1;
                warn!(line = line_no, error = %e, "Skipping sample");
                continue;
            }
        };

        stats.processed += 1;
        if verdict.is_anomaly {
            stats.flagged += 1;
            warn!(
                line = line_no,
                value = observation.value,
                mean = verdict.mean,
                threshold = verdict.threshold,
                "Anomaly detected"
            );
        }
        writer.write(&VerdictRecord {
            timestamp: observation.timestamp,
            value: observation.value,
            injected_spike: None,
            verdict,
        })?;
    }
    Ok(stats)
}

fn run_replay(
    input: Option<PathBuf>,
    detector_config: DetectorConfig,
    output: &OutputArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let reader: Box<dyn BufRead> = match &input {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin().lock())),
    };

    let mut detector = StreamAnomalyDetector::new(detector_config)?;
    let mut writer = VerdictWriter::new(BufWriter::new(io::stdout().lock()), output);

    let stats = replay(reader, &mut detector, &mut writer)?;
    writer.finish()?;

    info!(
        processed = stats.processed,
        flagged = stats.flagged,
        skipped = stats.skipped,
        "Replay complete"
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            samples,
            seed,
            base,
            noise,
            drift,
            spike_probability,
            detector,
            output,
        } => {
            let generator_config = GeneratorConfig {
                base,
                noise_std: noise,
                drift_per_step: drift,
                spike_probability,
                seed,
                ..Default::default()
            };
            run_simulate(generator_config, samples, detector.resolve()?, &output)
        }
        Commands::Replay {
            input,
            detector,
            output,
        } => run_replay(input, detector.resolve()?, &output),
    }
}
