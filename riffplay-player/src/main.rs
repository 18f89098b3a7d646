//! # riffplay
//!
//! Headless AVI player built on riffplay-core. Plays a file or a playlist
//! entry to the end (or a frame limit) and logs session statistics.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

use riffplay_core::audio_task::{shared_sink, SharedSink};
use riffplay_core::avi_demux::avi_probe;
use riffplay_core::{NullDisplay, PlaybackSession, PlayerConfig, Playlist, SessionBuilder};

/// Driver sleep between ticks.
const TICK_IDLE: Duration = Duration::from_millis(1);

struct PlayerOptions {
    input: Option<PathBuf>,
    playlist: Option<PathBuf>,
    entry: Option<String>,
    config: Option<PathBuf>,
    max_frames: Option<u64>,
    probe: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "riffplay=info,riffplay_core=info".into()),
        )
        .init();

    tracing::info!("riffplay v{}", riffplay_core::VERSION);

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let config = match &options.config {
        Some(path) => PlayerConfig::load(path)?,
        None => PlayerConfig::default(),
    };

    let input = match resolve_input(&options)? {
        Some(input) => input,
        None => return Ok(()),
    };

    if options.probe {
        let info = avi_probe(&input)?;
        println!("{:#}", info);
        return Ok(());
    }

    play(&input, config, options.max_frames)
}

/// Direct path, or a playlist entry. `None` when the playlist was only listed.
fn resolve_input(options: &PlayerOptions) -> Result<Option<PathBuf>> {
    if let Some(input) = &options.input {
        return Ok(Some(input.clone()));
    }

    let Some(playlist_path) = &options.playlist else {
        print_usage();
        return Err(anyhow::anyhow!("Missing --input or --playlist"));
    };
    let playlist = Playlist::load(playlist_path)?;

    match &options.entry {
        Some(key) => {
            let entry = playlist.find(key)?;
            tracing::info!("Playing '{}' from '{}'", entry.display_name, playlist.title);
            Ok(Some(playlist.resolve(entry)?))
        }
        None => {
            println!("{}", playlist.title);
            for (i, entry) in playlist.entries.iter().enumerate() {
                println!(
                    "  [{}] {:<16} {:<32} {}s",
                    i, entry.id, entry.display_name, entry.duration_sec
                );
            }
            Ok(None)
        }
    }
}

fn audio_sink() -> SharedSink {
    #[cfg(feature = "audio")]
    {
        shared_sink(riffplay_core::output::CpalSink::new())
    }
    #[cfg(not(feature = "audio"))]
    {
        shared_sink(riffplay_core::NullSink::realtime())
    }
}

fn play(input: &Path, config: PlayerConfig, max_frames: Option<u64>) -> Result<()> {
    tracing::info!("Opening {:?}", input);

    let mut session: PlaybackSession<_> = SessionBuilder::new(config)
        .display(Box::new(NullDisplay::new()))
        .audio_sink(audio_sink())
        .open_path(input)
        .map_err(|e| anyhow::anyhow!("Failed to open {:?}: {}", input, e))?;

    let info = session.info();
    tracing::info!(
        "Playing {}x{}, {} frames, codec {}",
        info.width,
        info.height,
        info.total_frames,
        info.video_codec.as_deref().unwrap_or("?")
    );

    session.run(max_frames, TICK_IDLE);
    let report = session.stop();

    tracing::info!(
        "Playback complete: displayed={}, dropped={}, decode_errors={}, progress={}%",
        report.stats.frames_displayed,
        report.stats.frames_dropped,
        report.stats.video_decode_errors,
        report.stats.progress_percent
    );
    if let Some(audio) = &report.audio {
        tracing::info!(
            "Audio: clean_stop={}, chunks={}, samples={}, lost={}, timeouts={}",
            audio.clean,
            audio.stats.chunks_received,
            audio.stats.samples_written,
            audio.stats.samples_lost,
            audio.stats.sink_timeouts
        );
    }

    Ok(())
}

fn parse_args(args: &[String]) -> Result<PlayerOptions> {
    let mut options = PlayerOptions {
        input: None,
        playlist: None,
        entry: None,
        config: None,
        max_frames: None,
        probe: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--input" | "-i" => {
                options.input = Some(PathBuf::from(arg_value(args, i)?));
                i += 2;
            }
            "--playlist" | "-p" => {
                options.playlist = Some(PathBuf::from(arg_value(args, i)?));
                i += 2;
            }
            "--entry" | "-e" => {
                options.entry = Some(arg_value(args, i)?.clone());
                i += 2;
            }
            "--config" | "-c" => {
                options.config = Some(PathBuf::from(arg_value(args, i)?));
                i += 2;
            }
            "--max-frames" | "-n" => {
                let raw = arg_value(args, i)?;
                options.max_frames = Some(raw.parse::<u64>().map_err(|e| {
                    anyhow::anyhow!("Invalid frame count {}: {}", raw, e)
                })?);
                i += 2;
            }
            "--probe" => {
                options.probe = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                tracing::warn!("Ignoring unknown argument {:?}", other);
                i += 1;
            }
        }
    }

    Ok(options)
}

fn arg_value(args: &[String], i: usize) -> Result<&String> {
    args.get(i + 1)
        .ok_or_else(|| anyhow::anyhow!("Missing value for {}", args[i]))
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  riffplay --input <file.avi> [--config <cfg.json>] [--max-frames <n>] [--probe]\n  riffplay --playlist <playlist.json> [--entry <id|index>] [--config <cfg.json>]\n"
    );
}
