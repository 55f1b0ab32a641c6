/// End-to-end scenarios across the node services.
///
/// A full node is built on a fake proof-of-work development chain and a
/// light node is served on-demand straight out of the full node's chain, so
/// both backends can be compared on the same data without any sockets.
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use ln_chain::{BlockChain, StateProcessor};
use ln_consensus::ConsensusEngine;
use ln_light::ChainOdrBackend;
use ln_node::{
    AccountManager, BackendError, LightNodeService, NodeConfig, NodeService, ServiceContext, Wallet,
};
use ln_types::params::TX_GAS;
use ln_types::{Address, BlockNumber, Header, Transaction, U256};
use tokio_util::sync::CancellationToken;

const SENDER: Address = Address([1u8; 20]);
const RECIPIENT: Address = Address([2u8; 20]);

/// Append `count` blocks, block `n` carrying one logging transfer priced at
/// `n` wei.
fn append_blocks(chain: &BlockChain, engine: &ConsensusEngine, count: u64) {
    for _ in 0..count {
        let parent = chain.current_block();
        let number = parent.number() + 1;
        let txs = vec![Transaction::new(
            SENDER,
            number - 1,
            Some(RECIPIENT),
            U256::one(),
            TX_GAS,
            U256::from(number),
            b"integration".to_vec(),
        )];
        let mut header = Header {
            parent_hash: parent.hash(),
            number,
            gas_limit: parent.header.gas_limit,
            time: parent.header.time + 10,
            ..Header::default()
        };
        engine.prepare(chain, &mut header).unwrap();
        let mut state = chain.state_at(&parent.header.state_root).unwrap();
        let (receipts, gas_used) = StateProcessor.process(&header, &txs, &mut state).unwrap();
        header.gas_used = gas_used;
        let block = engine.finalize(chain, header, &mut state, txs, &receipts);
        chain.insert_block(block).unwrap();
    }
}

async fn full_node(blocks: u64) -> Arc<NodeService> {
    let node = NodeService::new(ServiceContext::ephemeral(), NodeConfig::dev_ethash(&[SENDER]))
        .await
        .unwrap();
    append_blocks(&node.chain(), &node.engine(), blocks);
    node
}

/// Light node served by `full`, with its header chain synced to the same tip.
async fn light_node(full: &NodeService, latency: Duration) -> Arc<LightNodeService> {
    let odr = Arc::new(ChainOdrBackend::new(full.chain()).with_latency(latency));
    let config = NodeConfig::dev_ethash(&[SENDER]).light();
    let light = LightNodeService::new(ServiceContext::ephemeral(), config, odr).await.unwrap();

    let head = full.chain().current_block().number();
    let headers: Vec<Header> = (1..=head)
        .filter_map(|n| full.chain().get_header_by_number(n))
        .collect();
    light.chain().insert_header_chain(&headers).unwrap();
    light
}

async fn wait_for(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Dual-mode backend ───────────────────────────────────────────────────────

#[tokio::test]
async fn full_and_light_agree_on_lookups_by_hash() {
    let full = full_node(6).await;
    let light = light_node(&full, Duration::ZERO).await;
    let (fb, lb) = (full.backend(), light.backend());
    let token = CancellationToken::new();

    assert_eq!(fb.current_block().hash(), lb.current_block().hash());
    for n in 0..=6 {
        let hash = full.chain().get_header_by_number(n).unwrap().hash();
        assert_eq!(
            fb.header_by_hash(&token, &hash).await.unwrap(),
            lb.header_by_hash(&token, &hash).await.unwrap()
        );
        assert_eq!(
            fb.get_receipts(&token, &hash).await.unwrap(),
            lb.get_receipts(&token, &hash).await.unwrap()
        );
        assert_eq!(
            fb.get_logs(&token, &hash).await.unwrap(),
            lb.get_logs(&token, &hash).await.unwrap()
        );
        assert_eq!(
            fb.get_td(&token, &hash).await.unwrap(),
            lb.get_td(&token, &hash).await.unwrap()
        );
    }

    let logs = fb
        .get_logs(&token, &full.chain().current_block().hash())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].len(), 1);

    light.stop().await.unwrap();
    full.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_block_number_is_absent_on_both_backends() {
    let full = full_node(2).await;
    let light = light_node(&full, Duration::ZERO).await;
    let token = CancellationToken::new();

    for backend in [full.backend(), light.backend()] {
        assert!(backend
            .header_by_number(&token, BlockNumber::Number(1_000))
            .await
            .unwrap()
            .is_none());
        assert!(backend
            .block_by_number(&token, BlockNumber::Number(1_000))
            .await
            .unwrap()
            .is_none());
    }

    light.stop().await.unwrap();
    full.stop().await.unwrap();
}

#[tokio::test]
async fn light_pending_is_latest() {
    let full = full_node(3).await;
    let light = light_node(&full, Duration::ZERO).await;
    let backend = light.backend();
    let token = CancellationToken::new();

    let pending = backend.header_by_number(&token, BlockNumber::Pending).await.unwrap();
    let latest = backend.header_by_number(&token, BlockNumber::Latest).await.unwrap();
    assert_eq!(pending, latest);
    assert_eq!(latest.map(|h| h.number), Some(3));

    light.stop().await.unwrap();
    full.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_retrieval_returns_promptly() {
    let full = full_node(1).await;
    let light = light_node(&full, Duration::from_secs(30)).await;
    let backend = light.backend();
    let hash = full.chain().current_block().hash();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let result = backend.block_by_hash(&token, &hash).await;
    assert!(matches!(result, Err(BackendError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(light.retriever().in_flight(), 0);
    assert_eq!(light.metrics().odr_cancellations.get(), 1);

    light.stop().await.unwrap();
    full.stop().await.unwrap();
}

#[tokio::test]
async fn gas_price_suggestion_takes_sixtieth_percentile() {
    let full = full_node(20).await;
    let token = CancellationToken::new();
    let price = full.backend().suggest_price(&token).await.unwrap();
    assert_eq!(price, U256::from(12u64));
    full.stop().await.unwrap();
}

#[tokio::test]
async fn pool_rejections_surface_verbatim() {
    let full = full_node(2).await;
    let backend = full.backend();
    let token = CancellationToken::new();
    let pool = full.tx_pool();
    wait_for(|| pool.nonce(&SENDER) == 2).await;

    let stale = Transaction::new(SENDER, 0, Some(RECIPIENT), U256::one(), TX_GAS, U256::one(), Vec::new());
    let err = backend.send_tx(&token, stale).await.err().unwrap();
    assert!(matches!(err, BackendError::TxPool(ln_txpool::TxPoolError::NonceTooLow)));
    assert!(full.metrics().render().contains("nonce_too_low"));

    let fresh = Transaction::new(SENDER, 2, Some(RECIPIENT), U256::one(), TX_GAS, U256::one(), Vec::new());
    backend.send_tx(&token, fresh.clone()).await.unwrap();
    assert_eq!(backend.get_pool_transaction(&fresh.hash()), Some(fresh));
    assert_eq!(backend.get_pool_nonce(&token, &SENDER).await.unwrap(), 3);

    full.stop().await.unwrap();
}

// ── Mining ──────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_pending_follows_the_miner() {
    let wallet = Wallet::keystore("keystore://signer", vec![SigningKey::from_bytes(&[4u8; 32])]);
    let signer = wallet.accounts()[0];
    let ctx = ServiceContext::new(None, Arc::new(AccountManager::new(vec![wallet])));
    let node = NodeService::new(ctx, NodeConfig::dev(signer, 0)).await.unwrap();
    let backend = node.backend();
    let token = CancellationToken::new();

    let latest = backend.header_by_number(&token, BlockNumber::Latest).await.unwrap();
    let idle = backend.header_by_number(&token, BlockNumber::Pending).await.unwrap();
    assert_eq!(idle, latest);

    node.start_mining(true).unwrap();
    let miner = node.miner();
    wait_for(|| miner.pending_block().is_some()).await;

    let pending = backend.header_by_number(&token, BlockNumber::Pending).await.unwrap().unwrap();
    assert_eq!(Some(&pending), miner.pending_block().as_ref().map(|b| &b.header));
    assert_eq!(pending.number, 1);

    node.stop_mining().await;
    let after = backend.header_by_number(&token, BlockNumber::Pending).await.unwrap();
    assert_eq!(after, backend.header_by_number(&token, BlockNumber::Latest).await.unwrap());
    node.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proof_of_work_node_mines_blocks() {
    let config = NodeConfig {
        etherbase: Some(Address([0x99; 20])),
        ..NodeConfig::dev_ethash(&[SENDER])
    };
    let node = NodeService::new(ServiceContext::ephemeral(), config).await.unwrap();
    node.start_mining(false).unwrap();
    assert!(!node.protocol_manager().accept_txs());

    let chain = node.chain();
    wait_for(|| chain.current_block().number() >= 1).await;
    node.stop_mining().await;

    let block = chain.get_block_by_number(1).unwrap();
    assert_eq!(block.header.coinbase, Address([0x99; 20]));
    assert!(node.metrics().mined_blocks.get() >= 1);
    node.stop().await.unwrap();
}
