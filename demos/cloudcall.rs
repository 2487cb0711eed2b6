// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{crate_version, value_t, App, AppSettings, Arg, ArgMatches, SubCommand};
use serde_json::Value;

use cloudfn_rpc::transfer::{Progress, TransferOptions};
use cloudfn_rpc::{CancellationToken, Client, ClientConfig, Error, Source};

static APP: &'static str = "cloudcall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    let source = Arg::with_name("storage")
        .help("Use the storage source instead of the project source")
        .long("storage")
        .takes_value(false);

    App::new(app)
        .about("Command-line tool for calling a cloud functions server")
        .version(crate_version!())
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("abandon")
                .help("Cancel the call after this many milliseconds")
                .long("abandon-after")
                .takes_value(true)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("call")
                .about("Invoke a remote method")
                .arg(Arg::with_name("method").help("Class.Method").required(true))
                .arg(
                    Arg::with_name("args")
                        .help("JSON array of arguments")
                        .default_value("[]"),
                ),
        )
        .subcommand(
            SubCommand::with_name("methods")
                .about("List remote methods")
                .arg(Arg::with_name("commands").long("commands").takes_value(false)),
        )
        .subcommand(
            SubCommand::with_name("get")
                .about("Download a file")
                .arg(Arg::with_name("remote").required(true))
                .arg(Arg::with_name("local").required(true))
                .arg(source.clone()),
        )
        .subcommand(
            SubCommand::with_name("put")
                .about("Upload a file")
                .arg(Arg::with_name("local").required(true))
                .arg(Arg::with_name("remote").required(true))
                .arg(source),
        )
        .get_matches()
}

fn source_of(matches: &ArgMatches) -> Source {
    if matches.is_present("storage") {
        Source::Storage
    } else {
        Source::Project
    }
}

fn print_progress(p: Progress) {
    eprintln!("{:>12} / {:<12} {:6.2}%", p.so_far, p.total, p.percent);
}

async fn run(client: &Client, matches: &ArgMatches<'_>, cancel: &CancellationToken) -> Result<(), Error> {
    match matches.subcommand() {
        ("call", Some(sub)) => {
            let method = sub.value_of("method").unwrap_or_default();
            let mut names = method.splitn(2, '.');
            let (class_name, method_name) = match (names.next(), names.next()) {
                (Some(c), Some(m)) => (c, m),
                _ => return Err(Error::Validation(format!("expected Class.Method, got {}", method))),
            };
            let args: Vec<Value> = serde_json::from_str(sub.value_of("args").unwrap_or("[]"))?;
            match client
                .call_method_value(class_name, method_name, &args, cancel)
                .await?
            {
                Some(value) => println!("{}", value),
                None => println!("(void)"),
            }
        }
        ("methods", Some(sub)) => {
            let catalog = client.call_methods(sub.is_present("commands"), cancel).await?;
            for (class_name, methods) in catalog {
                for m in methods {
                    println!("{:>4} {}.{} {:?} {}", m.id, class_name, m.method_name, m.role, m.description);
                }
            }
        }
        ("get", Some(sub)) => {
            let options = TransferOptions {
                source: source_of(sub),
                skip_if_up_to_date: true,
            };
            let files = vec![(
                String::from(sub.value_of("remote").unwrap_or_default()),
                PathBuf::from(sub.value_of("local").unwrap_or_default()),
            )];
            let summary = client
                .download_files(&files, &options, print_progress, cancel)
                .await?;
            if summary.already_downloaded {
                println!("already up to date");
            } else {
                println!("{} bytes in {} round trips", summary.bytes, summary.groups);
            }
        }
        ("put", Some(sub)) => {
            let files = vec![(
                PathBuf::from(sub.value_of("local").unwrap_or_default()),
                String::from(sub.value_of("remote").unwrap_or_default()),
            )];
            let summary = client
                .upload_files(&files, source_of(sub), print_progress, cancel)
                .await?;
            println!("{} bytes in {} round trips", summary.bytes, summary.groups);
        }
        _ => (),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!("Failed to parse host and port as valid socket address: {}", e);
            process::exit(1)
        });

    let client = Client::connect(&addr, ClientConfig::default(), None)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to connect to server: {}", e);
            process::exit(1)
        });

    let cancel = CancellationToken::new();
    if let Ok(ms) = value_t!(matches, "abandon", u64) {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            cancel.cancel();
        });
    }

    if let Err(e) = run(&client, &matches, &cancel).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
