#![forbid(unsafe_code)]

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use alertcast_platform::commands::{CommandDispatcher, CommandTable};
use alertcast_platform::twitch::{ChatConfig, EventSubManager, EventSubSettings, HelixClient, HelixConfig, TwitchChat};
use alertcast_platform::youtube::{PollingEngine, YouTubeClient, poll_interval};
use alertcast_platform::{AlertSink, CredentialStore, InMemoryStore, RateLimiter};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::server::display::DisplaySettings;
use crate::server::health::HealthState;
use crate::server::http::{AppState, bind, spawn_public_server, spawn_test_server};
use crate::server::hub::{HubConfig, HubHandle, spawn_hub};
use crate::server::store::SqlStore;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: alertcast_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.alertcast/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG")
		.unwrap_or_else(|_| "info,alertcast_server=debug,alertcast_platform=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("alertcast_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn open_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn CredentialStore>> {
	match cfg.persistence.database_url.as_deref() {
		Some(url) => {
			let store = SqlStore::connect(url).await?;
			info!(backend = store.backend_name(), "persistence ready");
			Ok(Arc::new(store))
		}
		None => {
			warn!("no persistence.database_url; credentials and polling cursor will not survive restarts");
			Ok(Arc::new(InMemoryStore::new()))
		}
	}
}

fn build_dispatcher(cfg: &ServerConfig, sink: Arc<dyn AlertSink>) -> Arc<CommandDispatcher> {
	let table = match CommandTable::scan(&cfg.server.media_dir) {
		Ok(table) => table,
		Err(e) => {
			error!(error = ?e, dir = %cfg.server.media_dir.display(), "failed to scan command media; commands disabled");
			CommandTable::empty()
		}
	};
	info!(commands = table.len(), "command table loaded");

	Arc::new(CommandDispatcher::new(
		Arc::new(table),
		sink,
		cfg.twitch.chat.command_cooldown,
	))
}

/// Helix client plus webhook manager, or `None` when Twitch is not configured.
fn build_eventsub(
	cfg: &ServerConfig,
	store: Arc<dyn CredentialStore>,
	sink: Arc<dyn AlertSink>,
	cancel: &CancellationToken,
) -> anyhow::Result<Option<Arc<EventSubManager>>> {
	let tw = &cfg.twitch;
	let (Some(client_id), Some(client_secret), Some(channel)) =
		(tw.client_id.as_deref(), tw.client_secret.clone(), tw.channel_name.as_deref())
	else {
		info!("twitch not configured; webhook integration disabled");
		return Ok(None);
	};

	let helix = HelixClient::new(
		HelixConfig {
			helix_base_url: tw.helix_base_url.clone(),
			oauth_base_url: tw.oauth_base_url.clone(),
			..HelixConfig::new(client_id, client_secret)
		},
		cancel.clone(),
	)?;

	let settings = EventSubSettings {
		channel_login: channel.to_string(),
		base_url: cfg.server.base_url.clone().unwrap_or_default(),
		webhook_secret: tw.webhook_secret.clone().unwrap_or_default(),
		user_access_token: tw.user_access_token.clone().unwrap_or_default(),
	};

	Ok(Some(Arc::new(EventSubManager::new(Arc::new(helix), store, sink, settings))))
}

fn spawn_twitch_chat(cfg: &ServerConfig, sink: Arc<dyn AlertSink>, commands: Arc<CommandDispatcher>, cancel: &CancellationToken) {
	let chat = &cfg.twitch.chat;
	let (Some(bot), Some(token), Some(channel)) = (
		chat.bot_username.as_deref(),
		chat.bot_token.clone(),
		chat.channel_to_join.as_deref(),
	) else {
		info!("twitch chat not configured; chat commands disabled");
		return;
	};

	let client = TwitchChat::new(ChatConfig::new(bot, token, channel), sink, commands);
	let cancel = cancel.clone();
	tokio::spawn(async move { client.run(cancel).await });
}

fn spawn_youtube(
	cfg: &ServerConfig,
	store: Arc<dyn CredentialStore>,
	sink: Arc<dyn AlertSink>,
	commands: Arc<CommandDispatcher>,
	cancel: &CancellationToken,
) -> anyhow::Result<()> {
	let yt = &cfg.youtube;
	let (Some(api_key), Some(channel_id)) = (yt.api_key.clone(), yt.channel_id.as_deref()) else {
		info!("youtube not configured; live chat polling disabled");
		return Ok(());
	};

	let api = YouTubeClient::new(&yt.api_base_url, api_key)?;
	let engine = PollingEngine::new(
		channel_id,
		Arc::new(api),
		store,
		sink,
		commands,
		Arc::new(RateLimiter::api_default()),
		poll_interval(yt.polling_interval_secs),
		cancel.clone(),
	);

	tokio::spawn(async move {
		if let Err(e) = engine.run().await {
			error!(channel_id = engine.channel_id(), error = %e, "youtube polling stopped");
		}
	});
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let cancel = CancellationToken::new();
	let health = HealthState::new();

	let store = open_store(&cfg).await?;

	let hub: HubHandle = spawn_hub(
		HubConfig {
			client_queue_capacity: cfg.hub.client_queue_capacity,
		},
		cancel.clone(),
	);
	let sink: Arc<dyn AlertSink> = Arc::new(hub.clone());

	let commands = build_dispatcher(&cfg, sink.clone());
	let eventsub = build_eventsub(&cfg, store.clone(), sink.clone(), &cancel)?;

	// Listeners come up before subscription reconciliation: Twitch verifies
	// each new subscription by calling back while it is being created.
	let public = bind(&cfg.server.bind).await?;
	spawn_public_server(
		public,
		AppState {
			hub: hub.clone(),
			health: health.clone(),
			webhook: eventsub.clone(),
			websocket_path: Arc::from(cfg.server.websocket_path.as_str()),
			display: DisplaySettings::default(),
		},
		cancel.clone(),
	);
	info!(bind = %cfg.server.bind, ws = %cfg.server.websocket_path, "public listener ready");

	if let Some(test_bind) = cfg.server.test_bind.as_deref() {
		match bind(test_bind).await {
			Ok(listener) => {
				spawn_test_server(listener, hub.clone(), cancel.clone());
				info!(bind = %test_bind, "test alert listener ready");
			}
			Err(e) => warn!(error = ?e, "test alert listener disabled"),
		}
	}

	if let Some(manager) = eventsub {
		tokio::spawn(async move {
			match manager.start().await {
				Ok(report) => info!(
					user_id = %report.user_id,
					ensured = report.ensured.len(),
					failed = report.failed.len(),
					"twitch startup finished"
				),
				Err(e) => error!(error = ?e, "twitch startup failed; webhook subscriptions not managed"),
			}
		});
	}

	spawn_twitch_chat(&cfg, sink.clone(), commands.clone(), &cancel);

	if let Err(e) = spawn_youtube(&cfg, store.clone(), sink.clone(), commands.clone(), &cancel) {
		error!(error = ?e, "youtube polling disabled");
	}

	health.mark_ready();
	info!("alertcast_server ready");

	tokio::signal::ctrl_c().await?;
	info!("shutdown requested");
	cancel.cancel();

	Ok(())
}
