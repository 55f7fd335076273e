// Copyright 2018-2026 the Deno authors. MIT license.

//! Thin command-line front end: parse flags, assemble the embedder
//! configuration, compile the program and serve.

use std::collections::HashMap;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use xqd_runtime::ExecuteCtx;
use xqd_runtime::RuntimeConfig;
use xqd_runtime::UriBackend;

/// Run a Compute@Edge wasm program against local backends.
#[derive(Parser)]
#[command(name = "xqd", version)]
struct Flags {
  /// The wasm program to serve.
  #[arg(value_name = "WASM")]
  wasm: PathBuf,

  /// Socket address to listen on.
  #[arg(long, default_value = "127.0.0.1:7676")]
  addr: SocketAddr,

  /// Backend as `name=uri`, e.g. `origin=http://localhost:8000`.
  /// Repeatable.
  #[arg(long = "backend", value_name = "NAME=URI")]
  backends: Vec<String>,

  /// Dictionary as `name=file.json` (a flat string map). Repeatable.
  #[arg(long = "dictionary", value_name = "NAME=FILE")]
  dictionaries: Vec<String>,

  /// Config store as `name=file.json` (a flat string map). Repeatable.
  #[arg(long = "config-store", value_name = "NAME=FILE")]
  config_stores: Vec<String>,

  /// Secret store as `name=file.json` (a flat string map). Repeatable.
  #[arg(long = "secret-store", value_name = "NAME=FILE")]
  secret_stores: Vec<String>,

  /// ACL as `name=file.json` (an entry array). Repeatable.
  #[arg(long = "acl", value_name = "NAME=FILE")]
  acls: Vec<String>,

  /// Declare an (empty) KV store by name. Repeatable.
  #[arg(long = "kv-store", value_name = "NAME")]
  kv_stores: Vec<String>,

  /// Geolocation data: a JSON object keyed by IP address.
  #[arg(long = "geo", value_name = "FILE")]
  geo: Option<PathBuf>,

  /// Present every inbound request to the guest as TLS-terminated.
  #[arg(long)]
  secure: bool,

  /// Per-request wall-clock deadline in milliseconds.
  #[arg(long, value_name = "MS")]
  deadline_ms: Option<u64>,
}

fn split_pair<'a>(
  flag: &str,
  value: &'a str,
) -> anyhow::Result<(&'a str, &'a str)> {
  value
    .split_once('=')
    .with_context(|| format!("--{flag} expects NAME=VALUE, got {value:?}"))
}

fn load_string_map(path: &str) -> anyhow::Result<HashMap<String, String>> {
  let raw = std::fs::read_to_string(path)
    .with_context(|| format!("reading {path}"))?;
  serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
}

fn build_config(flags: &Flags) -> anyhow::Result<RuntimeConfig> {
  let mut config = RuntimeConfig::new();

  for backend in &flags.backends {
    let (name, uri) = split_pair("backend", backend)?;
    let uri: http::Uri = uri
      .parse()
      .with_context(|| format!("backend {name}: invalid uri"))?;
    config = config.with_backend(name, Arc::new(UriBackend::new(uri)));
  }

  for dictionary in &flags.dictionaries {
    let (name, path) = split_pair("dictionary", dictionary)?;
    let map = Arc::new(load_string_map(path)?);
    config = config
      .with_dictionary(name, Arc::new(move |key: &str| map.get(key).cloned()));
  }

  for store in &flags.config_stores {
    let (name, path) = split_pair("config-store", store)?;
    let map = Arc::new(load_string_map(path)?);
    config = config
      .with_config_store(name, Arc::new(move |key: &str| map.get(key).cloned()));
  }

  for store in &flags.secret_stores {
    let (name, path) = split_pair("secret-store", store)?;
    let map = Arc::new(load_string_map(path)?);
    config = config.with_secret_store(
      name,
      Arc::new(move |key: &str| {
        map.get(key).map(|value| value.as_bytes().to_vec())
      }),
    );
  }

  for acl in &flags.acls {
    let (name, path) = split_pair("acl", acl)?;
    let raw = std::fs::read_to_string(path)
      .with_context(|| format!("reading {path}"))?;
    let acl =
      xqd_acl::Acl::from_json(&raw).with_context(|| format!("acl {name}"))?;
    config = config.with_acl(name, acl);
  }

  for name in &flags.kv_stores {
    config = config.with_kv_store(name.clone());
  }

  if let Some(path) = &flags.geo {
    let raw = std::fs::read_to_string(path)
      .with_context(|| format!("reading {}", path.display()))?;
    let map: HashMap<String, serde_json::Value> = serde_json::from_str(&raw)
      .with_context(|| format!("parsing {}", path.display()))?;
    let map = Arc::new(map);
    config = config.with_geolocation(Arc::new(move |ip: IpAddr| {
      map.get(&ip.to_string()).map(|value| value.to_string())
    }));
  }

  if flags.secure {
    config = config.with_secure(Arc::new(|_| true));
  }

  if let Some(deadline_ms) = flags.deadline_ms {
    config = config.with_request_deadline(Duration::from_millis(deadline_ms));
  }

  Ok(config)
}

fn main() -> anyhow::Result<()> {
  env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or("info"),
  )
  .init();
  let flags = Flags::parse();

  let wasm = std::fs::read(&flags.wasm)
    .with_context(|| format!("reading {}", flags.wasm.display()))?;
  let config = build_config(&flags)?;
  let ctx = ExecuteCtx::new(config, &wasm).context("compiling program")?;

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()?;
  runtime.block_on(async move {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        log::info!("shutting down");
        Ok(())
      }
      result = xqd_runtime::serve(ctx, flags.addr) => result,
    }
  })
}
