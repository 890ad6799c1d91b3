extern crate chan_signal;
extern crate chrono;
extern crate clap;
extern crate fern;
extern crate scow;

#[macro_use]
extern crate log;

use chan_signal::Signal;
use chrono::Utc;
use clap::{App, Arg, ArgMatches, SubCommand};
use scow::channel::Channel;
use scow::config;
use scow::error::{Error, Result};
use scow::watch::Watch;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

enum OffsetCmd {
    Touch,
    Tell,
    Reset,
}

fn exit_code(err: &Error) -> i32 {
    match *err {
        Error::Config(_) => 2,
        Error::CannotLock { .. } => 3,
        _ => 1,
    }
}

fn main() {
    let matches = App::new("scow")
        .version(VERSION.unwrap_or("unknown"))
        .about("log shipping, hauled away by the scow-load")
        .arg(
            Arg::with_name("config-file")
                .long("config")
                .short("C")
                .value_name("config")
                .help("The config file to feed in.")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Turn on verbose output."),
        )
        .subcommand(
            SubCommand::with_name("consume")
                .about("Consume blocks from files once, then exit.")
                .arg(
                    Arg::with_name("reset")
                        .long("reset")
                        .help("Forget tracked offsets before consuming."),
                )
                .arg(Arg::with_name("paths").multiple(true).required(true)),
        )
        .subcommand(
            SubCommand::with_name("touch")
                .about("Mark files consumed up to their current offsets.")
                .arg(Arg::with_name("paths").multiple(true).required(true)),
        )
        .subcommand(
            SubCommand::with_name("tell")
                .about("Print where consumption of files would begin.")
                .arg(Arg::with_name("paths").multiple(true).required(true)),
        )
        .subcommand(
            SubCommand::with_name("reset")
                .about("Forget consumption progress for files.")
                .arg(Arg::with_name("paths").multiple(true).required(true)),
        )
        .subcommand(
            SubCommand::with_name("edit")
                .about("Edit a channel's tracked offsets in $EDITOR.")
                .arg(Arg::with_name("channel").required(true)),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("Watch paths and ship new blocks as they appear.")
                .arg(Arg::with_name("paths").multiple(true)),
        )
        .get_matches();

    // chan_signal insists on being set up before any other thread spawns
    let stop = if matches.subcommand_name() == Some("watch") {
        let signal = chan_signal::notify(&[Signal::INT, Signal::TERM]);
        let stop = Arc::new(AtomicBool::new(false));
        let signal_stop = stop.clone();
        thread::spawn(move || {
            signal.recv();
            info!("caught signal, shutting down");
            signal_stop.store(true, Ordering::Relaxed);
        });
        Some(stop)
    } else {
        None
    };

    let level = match matches.occurrences_of("verbose") {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][{}] {}",
                record.target(),
                record.line().unwrap_or(0),
                Utc::now().to_rfc3339(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(::std::io::stderr())
        .apply()
        .expect("could not set up logging");

    info!("scow - {}", VERSION.unwrap_or("unknown"));

    let code = match run(&matches, stop) {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            exit_code(&e)
        }
    };
    process::exit(code);
}

fn run(
    matches: &ArgMatches,
    stop: Option<Arc<AtomicBool>>,
) -> Result<()> {
    let config_path = matches
        .value_of("config-file")
        .expect("[INTERNAL ERROR] no config-file");
    let args = config::load(Path::new(config_path))?;
    match matches.subcommand() {
        ("consume", Some(sub)) => cmd_consume(&args, sub),
        ("touch", Some(sub)) => cmd_offsets(&args, sub, &OffsetCmd::Touch),
        ("tell", Some(sub)) => cmd_offsets(&args, sub, &OffsetCmd::Tell),
        ("reset", Some(sub)) => cmd_offsets(&args, sub, &OffsetCmd::Reset),
        ("edit", Some(sub)) => cmd_edit(&args, sub),
        ("watch", Some(sub)) => {
            cmd_watch(&args, sub, stop.expect("[INTERNAL ERROR] no stop flag"))
        }
        _ => Err(Error::Config(
            "no sub-command given; try --help".to_string(),
        )),
    }
}

fn arg_paths(matches: &ArgMatches) -> Vec<PathBuf> {
    matches
        .values_of("paths")
        .map(|paths| paths.map(|p| Path::new(p).to_path_buf()).collect())
        .unwrap_or_default()
}

fn cmd_consume(args: &config::Args, matches: &ArgMatches) -> Result<()> {
    let mut channels = config::build(args)?;
    let reset = matches.is_present("reset");
    for path in arg_paths(matches) {
        let mut matched = 0;
        for channel in &mut channels {
            let source_name = match channel.match_path(&path) {
                Some(source) => source.name.clone(),
                None => continue,
            };
            matched += 1;
            let _lock = lock_if_possible(channel)?;
            if reset {
                channel.reset(&path)?;
            }
            let summary = channel.consume(&path, Some(&source_name))?;
            println!(
                "{}:{} {} {} block(s) {} byte(s) {} error(s)",
                channel.name,
                source_name,
                path.display(),
                summary.count,
                summary.bytes,
                summary.errors
            );
        }
        debug!("{:?} matched {} channel(s)", path, matched);
    }
    Ok(())
}

fn cmd_offsets(
    args: &config::Args,
    matches: &ArgMatches,
    cmd: &OffsetCmd,
) -> Result<()> {
    let mut channels = config::build(args)?;
    for path in arg_paths(matches) {
        for channel in &mut channels {
            let source_name = match channel.match_path(&path) {
                Some(source) => source.name.clone(),
                None => continue,
            };
            match *cmd {
                OffsetCmd::Touch => {
                    let offset = channel.touch(&path)?;
                    println!(
                        "{}:{} {} {}",
                        channel.name,
                        source_name,
                        path.display(),
                        offset
                    );
                }
                OffsetCmd::Tell => {
                    let offset = channel.tell(&path)?;
                    println!(
                        "{}:{} {} {}",
                        channel.name,
                        source_name,
                        path.display(),
                        offset
                    );
                }
                OffsetCmd::Reset => {
                    channel.reset(&path)?;
                    println!(
                        "{}:{} {}",
                        channel.name,
                        source_name,
                        path.display()
                    );
                }
            }
        }
    }
    Ok(())
}

fn cmd_edit(args: &config::Args, matches: &ArgMatches) -> Result<()> {
    let name = matches
        .value_of("channel")
        .expect("[INTERNAL ERROR] no channel");
    let mut channels = config::build(args)?;
    let channel = match channels.iter_mut().find(|c| c.name == name) {
        Some(channel) => channel,
        None => {
            return Err(Error::Config(format!(
                "{:?} is not a channel",
                name
            )))
        }
    };
    let _lock = lock_if_possible(channel)?;
    if channel.edit()? {
        println!("{} tracker state applied", channel.name);
    } else {
        println!("{} tracker state unchanged", channel.name);
    }
    Ok(())
}

fn cmd_watch(
    args: &config::Args,
    matches: &ArgMatches,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let channels = config::build(args)?;
    if channels.is_empty() {
        return Err(Error::Config("no channels configured".to_string()));
    }
    let mut paths = arg_paths(matches);
    if paths.is_empty() {
        paths = args.watch_paths.clone();
    }
    if paths.is_empty() {
        return Err(Error::Config(
            "nothing to watch; give paths or set watch-paths".to_string(),
        ));
    }

    let mut locks = Vec::new();
    let mut workers = Vec::new();
    for channel in channels {
        if channel.lock_file.is_some() {
            locks.push(channel.lock(None, Duration::from_secs(1))?);
        }
        workers.push(channel.worker()?);
    }

    let workers = Watch::new(workers).run(&paths, true, stop)?;
    for worker in workers {
        worker.shutdown();
    }
    drop(locks);
    Ok(())
}

fn lock_if_possible(
    channel: &Channel,
) -> Result<Option<scow::channel::ChannelLock>> {
    if channel.lock_file.is_some() {
        Ok(Some(channel.lock(None, Duration::from_secs(1))?))
    } else {
        Ok(None)
    }
}
