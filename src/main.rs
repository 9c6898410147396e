//! Veil bridge relay
//!
//! Watches both chains for bridge requests, claims them with a bond,
//! resolves the confidential destination, pays out on the destination chain,
//! verifies the delivery and settles on the source chain. With envelope keys
//! configured it also attests and delivers canonical messages.

use std::sync::Arc;

use eyre::WrapErr;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use relay::api::{self, AppState};
use relay::bounded_cache::CacheConfig;
use relay::chains::evm::address_word;
use relay::chains::{EvmClient, SolanaClient};
use relay::claims::ClaimCoordinator;
use relay::config::Config;
use relay::contracts::solana_program::BridgeProgram;
use relay::crypto::KeystreamLimbCipher;
use relay::evidence::EvidenceVerifier;
use relay::executor::TransferExecutor;
use relay::hash::identity_to_bytes32;
use relay::processor::{BondSettings, MessageProcessor, PipelineSet, RequestPipeline};
use relay::reprocessor::Reprocessor;
use relay::resolver::{ConfidentialDestinationResolver, DestinationResolver, TestingFallbackResolver};
use relay::settlement::{
    AttestationProvider, FallbackAttestor, LocalKeyAttestor, NetworkAttestor, SettlementSubmitter,
};
use relay::store::{postgres, PgStore, StateStore};
use relay::types::Direction;
use relay::watchers::{DedupSender, EvmWatcher, SolanaWatcher, SourceChainWatcher, WatcherManager};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

fn shutdown_channel(senders: &mut Vec<mpsc::Sender<()>>) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel::<()>(1);
    senders.push(tx);
    rx
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting Veil bridge relay");

    let config = Config::load()?;
    info!(
        evm_chain_id = config.evm.chain_id,
        solana_chain_id = config.solana.chain_id,
        token_mappings = config.token_mappings.len(),
        env = ?config.relayer.env,
        "Configuration loaded"
    );

    let pool = postgres::create_pool(&config.database.url).await?;
    info!("Database connected");
    postgres::run_migrations(&pool).await?;
    info!("Database migrations complete");
    let store: Arc<dyn StateStore> = Arc::new(PgStore::new(pool));

    let retry = config.relayer.retry();
    let policy = config.relayer.submission_policy();
    let cache = CacheConfig::from_env();
    let mappings = Arc::new(config.token_mappings.clone());

    let evm = Arc::new(EvmClient::new(
        &config.evm.rpc_url,
        config.evm.chain_id,
        &config.evm.bridge_address,
        &config.evm.private_key,
        retry.clone(),
    )?);
    let program_id = config.solana.program_id()?;
    let program = BridgeProgram::new(program_id, config.confidential.mpc_program_id()?);
    let solana = Arc::new(SolanaClient::new(
        &config.solana.rpc_url,
        config.solana.keypair()?,
        program,
    ));

    let confidential = ConfidentialDestinationResolver::new(
        solana.clone(),
        Arc::new(KeystreamLimbCipher),
        config.confidential.network_pubkey()?,
        config.confidential.finalization_timeout(),
        config.confidential.finalization_poll(),
    );
    let resolver: Arc<dyn DestinationResolver> = match &config.confidential.testing_fallback_destination {
        Some(fallback) => {
            let fallback = identity_to_bytes32(fallback).wrap_err("Invalid TESTING_FALLBACK_DESTINATION")?;
            warn!("Testing fallback destination enabled");
            Arc::new(TestingFallbackResolver::new(confidential, fallback))
        }
        None => Arc::new(confidential),
    };

    info!(
        collector = %config.claims.slash_collector,
        slash_bps = config.claims.slash_bps,
        window_secs = config.claims.window_secs,
        "Claim rules loaded"
    );
    let evidence_interval = config.relayer.evidence_interval();

    let evm_to_sol = Arc::new(RequestPipeline::new(
        Direction::EvmToSol,
        store.clone(),
        ClaimCoordinator::new(
            evm.clone(),
            config.claims.rules(config.claims.min_bond_wei, address_word(&evm.address()))?,
            policy.clone(),
            cache.in_flight_size,
        ),
        resolver.clone(),
        TransferExecutor::new(solana.clone(), mappings.clone(), policy.clone()),
        EvidenceVerifier::new(solana.clone(), config.relayer.evidence_retries, evidence_interval),
        SettlementSubmitter::new(evm.clone(), config.relayer.evidence_url_base.clone())
            .with_policy(policy.clone()),
        BondSettings {
            claim_bond: config.claims.min_bond_wei,
            resolve_bond: config.claims.min_bond_lamports,
        },
        retry.clone(),
    ));

    let sol_to_evm = Arc::new(RequestPipeline::new(
        Direction::SolToEvm,
        store.clone(),
        ClaimCoordinator::new(
            solana.clone(),
            config
                .claims
                .rules(u128::from(config.claims.min_bond_lamports), solana.pubkey().to_bytes())?,
            policy.clone(),
            cache.in_flight_size,
        ),
        resolver,
        TransferExecutor::new(evm.clone(), mappings.clone(), policy.clone()),
        EvidenceVerifier::new(evm.clone(), config.relayer.evidence_retries, evidence_interval),
        SettlementSubmitter::new(solana.clone(), config.relayer.evidence_url_base.clone())
            .with_policy(policy.clone()),
        BondSettings {
            claim_bond: u128::from(config.claims.min_bond_lamports),
            resolve_bond: config.claims.min_bond_lamports,
        },
        retry.clone(),
    ));

    let pipelines = Arc::new(PipelineSet {
        evm_to_sol: evm_to_sol.clone(),
        sol_to_evm: sol_to_evm.clone(),
    });

    let keyring = config.attestation.keyring()?;
    let local_attestor = LocalKeyAttestor::new(&config.attestation.private_key)?;
    let network_attestor = match &config.attestation.url {
        Some(url) => Some(Box::new(NetworkAttestor::new(url)?) as Box<dyn AttestationProvider>),
        None => None,
    };
    let attestor: Arc<dyn AttestationProvider> =
        Arc::new(FallbackAttestor::new(network_attestor, local_attestor));

    let capacity = config.relayer.channel_capacity;
    let (evm_tx, evm_rx) = mpsc::channel(capacity);
    let (sol_tx, sol_rx) = mpsc::channel(capacity);
    let (message_sender, message_rx) = if keyring.is_some() {
        let (tx, rx) = mpsc::channel(capacity);
        (Some(DedupSender::new(tx, cache.dedup_size, cache.ttl_secs)), Some(rx))
    } else {
        info!("No envelope keys configured, message watcher disabled");
        (None, None)
    };

    let message_processor = message_rx.as_ref().map(|_| {
        Arc::new(MessageProcessor::new(
            store.clone(),
            attestor.clone(),
            evm.clone(),
            solana.clone(),
            mappings.clone(),
            policy.clone(),
            retry.clone(),
        ))
    });

    let watchers: Vec<Arc<dyn SourceChainWatcher>> = vec![
        Arc::new(EvmWatcher::new(
            &config.evm.ws_url,
            &config.evm.bridge_address,
            evm.clone(),
            DedupSender::new(evm_tx, cache.dedup_size, cache.ttl_secs),
            retry.clone(),
        )?),
        Arc::new(SolanaWatcher::new(
            &config.solana.ws_url,
            program_id,
            keyring,
            DedupSender::new(sol_tx, cache.dedup_size, cache.ttl_secs),
            message_sender,
        )),
    ];
    let watcher_manager = WatcherManager::new(watchers, config.relayer.reconnect_backoff());

    // Create shutdown channels
    let mut shutdown_senders = Vec::new();
    let watcher_shutdown = shutdown_channel(&mut shutdown_senders);
    let evm_pipeline_shutdown = shutdown_channel(&mut shutdown_senders);
    let sol_pipeline_shutdown = shutdown_channel(&mut shutdown_senders);
    let message_shutdown = shutdown_channel(&mut shutdown_senders);
    let reprocessor_shutdown = shutdown_channel(&mut shutdown_senders);

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        for tx in shutdown_senders {
            let _ = tx.send(()).await;
        }
    });

    // Start API server
    let api_state = AppState {
        store: store.clone(),
        verification: pipelines.clone(),
    };
    let api_bind = config.api.bind.clone();
    let api_port = config.api.port;
    tokio::spawn(async move {
        if let Err(e) = api::start_server(&api_bind, api_port, api_state).await {
            error!(error = %e, "API server error");
        }
    });

    let max_concurrent = config.relayer.max_concurrent_requests;
    let reprocessor = Reprocessor::new(store.clone(), pipelines.clone(), message_processor.clone(), max_concurrent);
    tokio::spawn(reprocessor.run(config.relayer.reprocess_interval(), reprocessor_shutdown));

    if let (Some(processor), Some(rx)) = (message_processor, message_rx) {
        tokio::spawn(processor.run(rx, message_shutdown, max_concurrent));
    }

    let evm_task = tokio::spawn(evm_to_sol.run(evm_rx, evm_pipeline_shutdown, max_concurrent));
    let sol_task = tokio::spawn(sol_to_evm.run(sol_rx, sol_pipeline_shutdown, max_concurrent));

    info!("Components initialized, starting processing");

    tokio::select! {
        result = watcher_manager.run(watcher_shutdown) => {
            if let Err(e) = result {
                error!(error = %e, "Watcher manager error");
            }
        }
        result = evm_task => {
            if let Err(e) = result {
                error!(error = %e, "EVM to Solana pipeline task failed");
            }
        }
        result = sol_task => {
            if let Err(e) = result {
                error!(error = %e, "Solana to EVM pipeline task failed");
            }
        }
    }

    info!("Veil bridge relay stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,veil_relay=debug,relay=debug"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
