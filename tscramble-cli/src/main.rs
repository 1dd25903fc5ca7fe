mod cli;
mod io;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::ToSocketAddrs;
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing::{Level, error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use pipeline_common::{CancellationToken, Pipeline, PipelineError, StreamContext};
use scrambler::{
    EcmgClient, EcmgConfig, EntropyMode, ScramblerConfig, ScramblerError, ScramblerPlugin, Service,
};
use ts::TsPacket;

use crate::cli::{Args, parse_control_word, parse_hex};
use crate::io::PacketReader;

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Scrambler(#[from] ScramblerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Usage(String),
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args) {
        error!("{e}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), CliError> {
    let config = build_config(&args)?;

    // Establish the ECMG session up front; channel parameters drive the
    // crypto-period scheduling.
    let session = match &args.ecmg {
        Some(ecmg) => {
            let super_cas_id = args.super_cas_id.ok_or_else(|| {
                CliError::Usage("--super-cas-id is required with --ecmg".into())
            })?;
            let addr = ecmg
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| CliError::Usage(format!("cannot resolve \"{ecmg}\"")))?;
            info!("connecting to ECMG at {addr}");
            Some(EcmgClient::open_session(EcmgConfig {
                addr,
                super_cas_id,
                channel_id: args.channel_id,
                stream_id: args.stream_id,
                ecm_id: args.ecm_id,
                cp_duration_100ms: (args.cp_duration * 10) as u16,
                version: args.ecmg_scs_version,
            })?)
        }
        None => {
            if args.control_word.is_none() {
                return Err(CliError::Usage(
                    "specify either --control-word or --ecmg".into(),
                ));
            }
            None
        }
    };

    let plugin = ScramblerPlugin::new(config, session)?;

    let context = StreamContext::arc_new(CancellationToken::new());
    context.set_bitrate(args.bitrate.unwrap_or(0));

    let input: Box<dyn Read> = match &args.input {
        Some(path) => Box::new(File::open(path)?),
        None => Box::new(std::io::stdin().lock()),
    };
    let output: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };
    let reader = PacketReader::new(BufReader::new(input));
    let mut writer = BufWriter::new(output);

    let pipeline = Pipeline::new(context).add_processor(plugin);
    pipeline.run(reader, &mut |pkt: &TsPacket| {
        writer.write_all(pkt.as_bytes())?;
        Ok(())
    })?;
    writer.flush()?;
    Ok(())
}

fn build_config(args: &Args) -> Result<ScramblerConfig, CliError> {
    let fixed_cw = args
        .control_word
        .as_deref()
        .map(parse_control_word)
        .transpose()
        .map_err(CliError::Usage)?;
    let access_criteria = args
        .access_criteria
        .as_deref()
        .map(parse_hex)
        .transpose()
        .map_err(|e| CliError::Usage(format!("invalid access criteria: {e}")))?
        .unwrap_or_default();
    let ca_private_data = args
        .private_data
        .as_deref()
        .map(parse_hex)
        .transpose()
        .map_err(|e| CliError::Usage(format!("invalid CA private data: {e}")))?
        .unwrap_or_default();

    Ok(ScramblerConfig {
        service: Service::parse(&args.service),
        fixed_cw,
        scramble_audio: !args.no_audio,
        scramble_video: !args.no_video,
        scramble_subtitles: args.subtitles,
        component_level: args.component_level,
        synchronous_ecmg: args.synchronous,
        ignore_scrambled: args.ignore_scrambled,
        ecm_pid: args.pid_ecm,
        ecm_bitrate: args.bitrate_ecm,
        cp_duration_ms: args.cp_duration * 1000,
        partial_scrambling: args.partial_scrambling,
        access_criteria,
        ca_private_data,
        super_cas_id: args.super_cas_id.unwrap_or(0),
        entropy_mode: if args.no_entropy_reduction {
            EntropyMode::FullCw
        } else {
            EntropyMode::ReduceEntropy
        },
    })
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    // The transport stream rides on stdout; logs go to stderr.
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}
