use anyhow::Context;
use breakwater::auth::AccessControl;
use breakwater::http::{self, App};
use breakwater::{BuiltinPolicy, Config, Verdict};
use clap::Parser;
use replication::{Replicator, SymmetricKey};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// An anti-abuse decision engine for authentication events.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Address the REST API listens on.
    #[arg(long, default_value = "127.0.0.1:8084", env = "BW_LISTEN")]
    listen: SocketAddr,

    /// Path to the JSON configuration file.
    #[arg(long, env = "BW_CONFIG")]
    config: Option<PathBuf>,

    /// Print a fresh replication key and exit.
    #[arg(long, action(clap::ArgAction::SetTrue))]
    generate_key: bool,

    #[command(flatten)]
    log_args: ops::LogArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    ops::init_logging(&cli.log_args);

    if cli.generate_key {
        println!("{}", replication::generate_key());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let default_db = bootstrap_stores(&config)?;
    bootstrap_webhooks(&config)?;
    bootstrap_replication(&config)?;
    bootstrap_persistence(&config);

    lists::bl_db().start_expiry_worker();
    lists::wl_db().start_expiry_worker();

    let verdict = Verdict::new(Box::new(BuiltinPolicy::new(
        default_db,
        config.policy.clone(),
    )));
    let access = AccessControl::new(config.password.clone(), config.effective_acl());
    let app = Arc::new(App::new(verdict, access));
    let router = http::build_router(app);

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    tracing::info!(listen = %cli.listen, "breakwater listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("serving the REST API")?;
    Ok(())
}

/// Create and register every configured stats store, returning the one the
/// built-in policy reads.
fn bootstrap_stores(config: &Config) -> anyhow::Result<statsdb::StatsDb> {
    let defaults;
    let store_configs: &[breakwater::config::StatsDbConfig] = if config.stats_dbs.is_empty() {
        defaults = Config::default_stats_dbs();
        &defaults
    } else {
        &config.stats_dbs
    };

    let mut first: Option<statsdb::StatsDb> = None;
    for sc in store_configs {
        let schema = statsdb::parse_field_schema(
            sc.fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )
        .with_context(|| format!("fields of stats store '{}'", sc.name))?;

        let db = statsdb::StatsDb::with_fields(
            &sc.name,
            sc.window_size,
            sc.num_windows,
            sc.num_shards,
            schema,
        );
        db.set_v4_prefix(sc.v4_prefix);
        db.set_v6_prefix(sc.v6_prefix);
        if let Some(size) = sc.soft_max_entries {
            db.set_size_soft(size);
        }
        if let Some(ms) = sc.expire_sleep_ms {
            db.set_expire_sleep(ms);
        }
        if sc.replicated {
            db.enable_replication();
        }
        statsdb::register(db.clone())
            .with_context(|| format!("registering stats store '{}'", sc.name))?;
        db.start_expire_workers();
        tracing::info!(
            name = %sc.name,
            window_size = sc.window_size,
            num_windows = sc.num_windows,
            num_shards = sc.num_shards,
            "created stats store"
        );
        first.get_or_insert(db);
    }

    statsdb::lookup("default")
        .or(first)
        .context("no stats stores configured")
}

fn bootstrap_webhooks(config: &Config) -> anyhow::Result<()> {
    let runner = webhooks::global_runner();
    let pool = &config.webhook_pool;
    runner.set_num_threads(pool.num_threads);
    runner.set_max_conns(pool.max_conns);
    runner.set_max_queue_size(pool.max_queue_size);
    runner.set_timeout(pool.timeout_secs);
    runner.set_verify_peer(pool.verify_peer);
    runner.set_verify_host(pool.verify_host);
    if let Some(path) = &pool.ca_cert_bundle {
        runner.set_ca_cert_bundle(path.clone());
    }

    let db = webhooks::global_db();
    for hook_config in &config.webhooks {
        let id = db.next_id();
        let hook = match &hook_config.name {
            Some(name) => webhooks::WebHook::new_custom(
                id,
                name,
                hook_config.active,
                hook_config.config.clone(),
            ),
            None => webhooks::WebHook::new(
                id,
                hook_config.events.clone(),
                hook_config.active,
                hook_config.config.clone(),
            ),
        };
        db.add_webhook(hook)
            .map_err(|err| anyhow::anyhow!("webhook {id}: {err}"))?;
    }
    runner.start_threads();
    Ok(())
}

fn bootstrap_replication(config: &Config) -> anyhow::Result<()> {
    let Some(rc) = &config.replication else {
        return Ok(());
    };

    let key = SymmetricKey::from_base64(&rc.key).context("replication key")?;
    let replicator = Replicator::new(key, rc.peers.clone()).context("replication socket")?;

    let sink = replicator.sink();
    for name in statsdb::names() {
        if let Some(db) = statsdb::lookup(&name) {
            db.set_replication_sink(sink.clone());
        }
    }
    lists::bl_db().set_replication_sink(sink.clone());
    lists::wl_db().set_replication_sink(sink.clone());

    if let Some(listen) = rc.listen {
        replicator
            .start_receiver(listen)
            .with_context(|| format!("binding replication listener {listen}"))?;
    }
    tracing::info!(peers = rc.peers.len(), "replication enabled");
    Ok(())
}

fn bootstrap_persistence(config: &Config) {
    let Some(redis) = &config.redis else {
        return;
    };
    for db in [lists::bl_db(), lists::wl_db()] {
        db.make_persistent(&redis.host, redis.port);
        db.set_persist_replicated(redis.persist_replicated);
        db.set_connect_timeout(redis.connect_timeout_secs);
        if let Some(prefix) = &redis.prefix {
            // Both sides may share a prefix: the kind names embedded in the
            // keys keep them apart on reload.
            db.set_redis_prefix(prefix);
        }
        if let Err(err) = db.load_persisted() {
            tracing::error!(list = db.side().label(), %err, "loading persisted entries");
        }
    }
}
