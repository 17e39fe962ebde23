// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! extendctl - command-line client and test proxy for extend services
//!
//! # Usage
//!
//! ```bash
//! # Run an in-memory proxy with a datagram name service
//! extendctl serve --bind 127.0.0.1:9099 --discovery 127.0.0.1:7574
//!
//! # Cache operations
//! extendctl -p 127.0.0.1:9099 cache orders put k1 v1
//! extendctl -p 127.0.0.1:9099 cache orders get k1
//!
//! # Topics
//! extendctl -p 127.0.0.1:9099 publish events hello world
//! extendctl -p 127.0.0.1:9099 subscribe events --group audit
//!
//! # Invocation and names
//! extendctl -p 127.0.0.1:9099 query echo payload
//! extendctl --discovery 127.0.0.1:7574 lookup ExtendProxy
//! ```

use clap::{Parser, Subcommand};
use colored::Colorize;
use extend_client::server::{InMemoryBackend, NameServiceResponder, ProxyServer};
use extend_client::service::InvocationTask;
use extend_client::{
    RemoteCacheService, RemoteInvocationService, RemoteNameService, RemoteTopicService, Scope,
    ServiceContext, ServiceDependencies, Value,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Command-line client for extend proxies
#[derive(Parser, Debug)]
#[command(name = "extendctl")]
#[command(about = "Command-line client and test proxy for extend services")]
#[command(version)]
struct Args {
    /// Configuration file (.json, .yaml); EXTEND_* variables apply otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Proxy address (repeatable)
    #[arg(short, long = "proxy")]
    proxy: Vec<String>,

    /// Name-service address used to locate the proxy (repeatable)
    #[arg(long = "name-service")]
    name_service: Vec<String>,

    /// Datagram discovery address
    #[arg(long)]
    discovery: Option<String>,

    /// Cluster name
    #[arg(long)]
    cluster: Option<String>,

    /// Request timeout in milliseconds (<= 0 waits indefinitely)
    #[arg(long)]
    timeout_ms: Option<i64>,

    /// Verbose logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an in-memory proxy
    Serve {
        /// TCP listen address
        #[arg(short, long, default_value = "127.0.0.1:9099")]
        bind: SocketAddr,

        /// Also answer datagram name lookups on this address
        #[arg(long)]
        discovery: Option<SocketAddr>,

        /// Bind a name to a text value (name=value, repeatable)
        #[arg(long = "name")]
        names: Vec<String>,
    },

    /// Operate on a named cache
    Cache {
        /// Cache name (empty selects the default cache)
        name: String,

        #[command(subcommand)]
        op: CacheOp,
    },

    /// Publish values to a topic
    Publish {
        topic: String,

        /// Values to publish
        #[arg(required = true)]
        values: Vec<String>,
    },

    /// Receive values from a topic until Ctrl+C
    Subscribe {
        topic: String,

        /// Subscriber group (anonymous when omitted)
        #[arg(short, long)]
        group: Option<String>,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "200")]
        interval_ms: u64,
    },

    /// Run a named task on the proxy's member
    Query {
        task: String,

        /// Task payload
        #[arg(default_value = "")]
        payload: String,
    },

    /// Look a name up
    Lookup { name: String },
}

#[derive(Subcommand, Debug)]
enum CacheOp {
    Get { key: String },
    Put { key: String, value: String },
    Remove { key: String },
    Size,
    Keys,
    Clear,
    /// Destroy the cache on the proxy
    Destroy,
}

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    if args.no_color {
        colored::control::set_override(false);
    }

    let result = dependencies(&args).and_then(|deps| match &args.command {
        Commands::Serve {
            bind,
            discovery,
            names,
        } => cmd_serve(&deps, *bind, *discovery, names),
        Commands::Cache { name, op } => cmd_cache(deps, name, op),
        Commands::Publish { topic, values } => cmd_publish(deps, topic, values),
        Commands::Subscribe {
            topic,
            group,
            interval_ms,
        } => cmd_subscribe(deps, topic, group.as_deref(), *interval_ms),
        Commands::Query { task, payload } => cmd_query(deps, task, payload),
        Commands::Lookup { name } => cmd_lookup(deps, name),
    });

    if let Err(e) = result {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn dependencies(args: &Args) -> Result<ServiceDependencies, Box<dyn std::error::Error>> {
    let mut deps = match &args.config {
        Some(path) => ServiceDependencies::from_file(path)?,
        None => ServiceDependencies::from_env(),
    };
    deps.member_name = "extendctl".into();
    if !args.proxy.is_empty() {
        deps.proxy_addresses = args.proxy.clone();
    }
    if !args.name_service.is_empty() {
        deps.name_service_addresses = args.name_service.clone();
    }
    if let Some(discovery) = &args.discovery {
        deps.discovery_address = Some(discovery.clone());
    }
    if let Some(cluster) = &args.cluster {
        deps.cluster_name = cluster.clone();
    }
    if let Some(ms) = args.timeout_ms {
        deps.request_timeout_ms = ms;
    }
    deps.validate()?;
    Ok(deps)
}

fn interrupt_flag() -> Result<Arc<AtomicBool>, Box<dyn std::error::Error>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_serve(
    deps: &ServiceDependencies,
    bind: SocketAddr,
    discovery: Option<SocketAddr>,
    names: &[String],
) -> CliResult {
    let backend = Arc::new(InMemoryBackend::new());
    for binding in names {
        let (name, value) = binding
            .split_once('=')
            .ok_or_else(|| format!("expected name=value, got '{}'", binding))?;
        backend.bind_name(name, Value::from(value));
    }

    let server = ProxyServer::bind(bind, deps.socket.clone(), backend.clone())?;
    server.start()?;
    backend.bind_proxy_address(deps.remote_service_name.clone(), server.local_address());

    let responder = match discovery {
        Some(addr) => {
            let responder = NameServiceResponder::bind(addr, &deps.cluster_name, backend.clone())?;
            responder.start()?;
            Some(responder)
        }
        None => None,
    };

    println!(
        "{} {} on {}",
        "Serving".green().bold(),
        deps.remote_service_name,
        server.local_address().to_string().cyan()
    );
    if let Some(responder) = &responder {
        println!(
            "{} cluster '{}' on {}",
            "Answering lookups for".green().bold(),
            deps.cluster_name,
            responder.local_address().to_string().cyan()
        );
    }

    let running = interrupt_flag()?;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    if let Some(responder) = responder {
        responder.stop();
    }
    server.stop();
    println!(
        "{} caches: {:?}, topics: {:?}",
        "Stopped.".dimmed(),
        backend.cache_names(),
        backend.topic_names()
    );
    Ok(())
}

fn cmd_cache(deps: ServiceDependencies, name: &str, op: &CacheOp) -> CliResult {
    let context = ServiceContext::tcp(&deps);
    let service = RemoteCacheService::new(deps, context)?;
    service.start()?;
    let scope = Scope::new("extendctl");
    let cache = service.ensure_cache(name, Some(&scope))?;

    match op {
        CacheOp::Get { key } => print_optional(cache.get(key.as_bytes())?),
        CacheOp::Put { key, value } => {
            let previous = cache.put(key.as_bytes(), value.as_bytes())?;
            println!("{} {}", "OK".green(), key);
            if let Some(previous) = previous {
                println!("{} {}", "previous:".dimmed(), String::from_utf8_lossy(&previous));
            }
        }
        CacheOp::Remove { key } => print_optional(cache.remove(key.as_bytes())?),
        CacheOp::Size => println!("{}", cache.size()?),
        CacheOp::Keys => {
            for key in cache.keys()? {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
        CacheOp::Clear => {
            cache.clear()?;
            println!("{}", "OK".green());
        }
        CacheOp::Destroy => {
            service.destroy_cache(&cache)?;
            println!("{} {}", "Destroyed".yellow(), cache.name());
        }
    }

    service.shutdown();
    Ok(())
}

fn cmd_publish(deps: ServiceDependencies, topic: &str, values: &[String]) -> CliResult {
    let context = ServiceContext::tcp(&deps);
    let service = RemoteTopicService::new(deps, context)?;
    service.start()?;
    let topic = service.ensure_topic(topic, Some(&Scope::new("extendctl")))?;
    let publisher = topic.ensure_publisher(None)?;

    for value in values {
        publisher.publish(value.as_bytes().to_vec())?;
    }
    publisher.close()?;
    println!(
        "{} {} value(s) to {}",
        "Published".green().bold(),
        values.len(),
        topic.name().cyan()
    );

    service.shutdown();
    Ok(())
}

fn cmd_subscribe(
    deps: ServiceDependencies,
    topic: &str,
    group: Option<&str>,
    interval_ms: u64,
) -> CliResult {
    let context = ServiceContext::tcp(&deps);
    let service = RemoteTopicService::new(deps, context)?;
    service.start()?;
    let topic = service.ensure_topic(topic, Some(&Scope::new("extendctl")))?;
    let subscriber = topic.ensure_subscriber(group)?;
    eprintln!(
        "{} {} (group: {})",
        "Subscribed to".green().bold(),
        topic.name().cyan(),
        group.unwrap_or("-")
    );

    let running = interrupt_flag()?;
    let mut total = 0usize;
    while running.load(Ordering::SeqCst) && topic.is_active() {
        let values = subscriber.receive(64)?;
        if values.is_empty() {
            std::thread::sleep(Duration::from_millis(interval_ms));
            continue;
        }
        for value in values {
            total += 1;
            println!("{} {}", format!("[{}]", total).dimmed(), String::from_utf8_lossy(&value));
        }
    }
    if !topic.is_active() {
        eprintln!("{} topic is no longer available", "Warning".yellow());
    }

    subscriber.close()?;
    service.shutdown();
    eprintln!("\n{} Received {} value(s)", "---".dimmed(), total);
    Ok(())
}

fn cmd_query(deps: ServiceDependencies, task: &str, payload: &str) -> CliResult {
    let context = ServiceContext::tcp(&deps);
    let service = RemoteInvocationService::new(deps, context)?;
    service.start()?;

    let results = service.query(&InvocationTask::new(task, payload.as_bytes().to_vec()), None)?;
    for (member, value) in results {
        println!("{} {}", format!("{}:", member).cyan(), render(&value));
    }

    service.shutdown();
    Ok(())
}

fn cmd_lookup(deps: ServiceDependencies, name: &str) -> CliResult {
    let context = ServiceContext::tcp(&deps);
    let service = RemoteNameService::new(deps, context)?;
    service.start()?;

    let value = service.lookup(name)?;
    if value.is_null() {
        println!("{} {}", name, "(not bound)".dimmed());
    } else {
        println!("{} = {}", name.cyan(), render(&value));
    }

    service.shutdown();
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn print_optional(value: Option<Vec<u8>>) {
    match value {
        Some(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
        None => println!("{}", "(none)".dimmed()),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        other => other.to_string(),
    }
}
