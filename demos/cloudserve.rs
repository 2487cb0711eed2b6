// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::prelude::*;
use clap::{crate_version, App, Arg, ArgMatches};
use serde_json::{json, Value};
use slog::{error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use cloudfn_rpc::config::from_json_file;
use cloudfn_rpc::methods::{
    CallContext, DeclaredType, MethodCandidate, MethodRegistry, PrimitiveType, ProcedureError, Role,
};
use cloudfn_rpc::policy::ReadOnly;
use cloudfn_rpc::storage::LocalFileStore;
use cloudfn_rpc::{Server, ServerConfig};

static APP: &'static str = "cloudserve";
static DEFAULT_ADDR: &'static str = "127.0.0.1:2030";

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Serve cloud function requests for a local directory")
        .version(crate_version!())
        .arg(
            Arg::with_name("address")
                .help("Address to listen on (Default: 127.0.0.1:2030)")
                .long("address")
                .short("a")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("root")
                .help("Directory served as the project source")
                .long("root")
                .short("r")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("storage")
                .help("Directory served as the storage source")
                .long("storage")
                .short("s")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .help("JSON server configuration file")
                .long("config")
                .short("c")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("read_only")
                .help("Refuse every request that modifies files or strings")
                .long("read-only")
                .takes_value(false),
        )
        .get_matches()
}

fn arg_i64(args: &[Value], i: usize) -> Result<i64, ProcedureError> {
    args.get(i)
        .and_then(Value::as_i64)
        .ok_or_else(|| ProcedureError::new(format!("argument {} is not an integer", i)))
}

fn sample_methods() -> Result<MethodRegistry, String> {
    let int = || DeclaredType::Primitive(PrimitiveType::Int);
    MethodRegistry::from_candidates(vec![
        MethodCandidate::new("Math", "Add", |_ctx: CallContext, args: Vec<Value>| async move {
            Ok::<Value, ProcedureError>(json!(arg_i64(&args, 0)? + arg_i64(&args, 1)?))
        })
        .param("a", int())
        .param("b", int())
        .returns(DeclaredType::Primitive(PrimitiveType::Long))
        .description("sum of two integers"),
        MethodCandidate::new("Clock", "Now", |_ctx: CallContext, _args: Vec<Value>| async move {
            let now = Utc::now();
            Ok::<Value, ProcedureError>(json!({
                "timestamp": now.timestamp_millis(),
                "iso8601": now.to_rfc3339(),
            }))
        })
        .returns(DeclaredType::Structure {
            type_name: String::from("Date"),
            fields: vec![
                (String::from("timestamp"), DeclaredType::Primitive(PrimitiveType::Long)),
                (String::from("iso8601"), DeclaredType::Primitive(PrimitiveType::DateTime)),
            ],
        }),
        MethodCandidate::new("Echo", "Delay", |ctx: CallContext, args: Vec<Value>| async move {
            let mut left = arg_i64(&args, 1)?.max(0) as u64;
            while left > 0 {
                if ctx.is_cancelled() {
                    return Err(ProcedureError::new("caller went away"));
                }
                let step = left.min(50);
                tokio::time::sleep(Duration::from_millis(step)).await;
                left -= step;
            }
            Ok::<Value, ProcedureError>(args[0].clone())
        })
        .param("value", DeclaredType::Primitive(PrimitiveType::Json))
        .param("delay_ms", int())
        .returns(DeclaredType::Primitive(PrimitiveType::Json)),
        MethodCandidate::new("Admin", "Ping", |ctx: CallContext, _args: Vec<Value>| async move {
            Ok::<Value, ProcedureError>(json!(format!("pong {}", ctx.request_id)))
        })
        .role(Role::Admin)
        .returns(DeclaredType::Primitive(PrimitiveType::String))
        .command("check that the server answers admin calls"),
    ])
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let matches = parse_opts(APP.to_string());
    let addr = matches
        .value_of("address")
        .unwrap_or(DEFAULT_ADDR)
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!("Failed to parse listen address: {}", e);
            process::exit(1)
        });

    let config: ServerConfig = match matches.value_of("config") {
        Some(path) => from_json_file(path).unwrap_or_else(|e| {
            eprintln!("Failed to load configuration {}: {}", path, e);
            process::exit(1)
        }),
        None => ServerConfig::default(),
    };

    let mut files = LocalFileStore::new(PathBuf::from(matches.value_of("root").unwrap_or(".")));
    if let Some(storage) = matches.value_of("storage") {
        files = files.with_storage(storage);
    }

    let methods = sample_methods().unwrap_or_else(|e| {
        eprintln!("Failed to register methods: {}", e);
        process::exit(1)
    });
    info!(root_log, "registered methods"; "count" => methods.len());

    let mut server = Server::new(config, Arc::new(files), Some(&root_log)).with_methods(methods);
    if matches.is_present("read_only") {
        server = server.with_policy(Arc::new(ReadOnly));
    }
    let server = Arc::new(server);

    let listener = TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind {}: {}", addr, e);
        process::exit(1)
    });

    {
        let server = Arc::clone(&server);
        let log = root_log.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(log, "interrupted, shutting down");
                server.shutdown();
            }
        });
    }

    if let Err(e) = server.serve(listener).await {
        error!(root_log, "server failed"; "err" => %e);
    }
}
