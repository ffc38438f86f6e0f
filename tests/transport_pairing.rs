//! Pairing over the real transport paths: hub dial/accept and framed TCP.
//!
//! The two-party protocol tests live in `two_party_flow.rs` with
//! pre-established connections; these cover the establishment itself.

use std::sync::Arc;

use reclaim::config::{ConfirmationConfig, RetryConfig, Role};
use reclaim::network::channel::PeerChannel;
use reclaim::network::memory::MemoryHub;
use reclaim::network::tcp::TcpTransport;
use reclaim::network::transport::PeerTransport;
use reclaim::orchestrator::{RegistrationOrchestrator, RegistrationStage, SubmissionPath};
use reclaim::settlement::SettlementClient;
use reclaim::settlement_mock::MockSettlement;
use reclaim::signer::MockSigner;
use reclaim::types::{ClaimForm, PeerId};

fn form() -> ClaimForm {
    ClaimForm {
        compromised_address: "0xvictim".to_string(),
        recipient_address: "0xsafe".to_string(),
        reported_chain_id: 1,
        incident_timestamp: 1_700_000_000,
    }
}

async fn orchestrator(
    role: Role,
    path: SubmissionPath,
    transport: Arc<dyn PeerTransport>,
    settlement: Arc<MockSettlement>,
) -> Arc<RegistrationOrchestrator> {
    RegistrationOrchestrator::new(
        role,
        path,
        137,
        ConfirmationConfig::default(),
        RetryConfig::default(),
        PeerChannel::new(transport),
        settlement as Arc<dyn SettlementClient>,
        Arc::new(MockSigner::new(match role {
            Role::Registeree => "victim-wallet",
            Role::Relayer => "relayer-wallet",
        })),
    )
    .await
}

#[tokio::test]
async fn hub_dial_accept_pairing_reaches_grace_period() {
    let hub = MemoryHub::new();
    let registeree_tp = Arc::new(hub.endpoint(PeerId::from("victim-phone")).await);
    let relayer_tp = Arc::new(hub.endpoint(PeerId::from("relayer-laptop")).await);

    let settlement = Arc::new(MockSettlement::new());
    let registeree = orchestrator(
        Role::Registeree,
        SubmissionPath::Relayed,
        registeree_tp,
        settlement.clone(),
    )
    .await;
    let relayer = orchestrator(
        Role::Relayer,
        SubmissionPath::Direct,
        Arc::clone(&relayer_tp) as Arc<dyn PeerTransport>,
        settlement.clone(),
    )
    .await;

    // Relayer waits for the inbound connection like a real listener would
    let relayer_accept = Arc::clone(&relayer);
    tokio::spawn(async move {
        let (peer, conn) = relayer_tp.accept().await.unwrap();
        relayer_accept.attach(peer, conn).await;
    });

    registeree
        .pair_with(PeerId::from("relayer-laptop"), form())
        .await
        .unwrap();
    registeree
        .sign_and_dispatch_acknowledgement(137)
        .await
        .unwrap();

    let stage = registeree
        .wait_for_stage(RegistrationStage::GracePeriod)
        .await;
    assert_eq!(stage, RegistrationStage::GracePeriod);
    assert_eq!(relayer.stage(), RegistrationStage::GracePeriod);
}

#[tokio::test]
async fn tcp_pairing_reaches_grace_period() {
    let relayer_tp = Arc::new(
        TcpTransport::bind(
            PeerId::from("relayer-laptop"),
            "127.0.0.1:0",
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap(),
    );
    let relayer_addr = relayer_tp.local_addr().await.unwrap();

    let registeree_tp = Arc::new(
        TcpTransport::bind(
            PeerId::from("victim-phone"),
            "127.0.0.1:0",
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap(),
    );
    registeree_tp
        .add_peer(PeerId::from("relayer-laptop"), relayer_addr.to_string())
        .await;

    let settlement = Arc::new(MockSettlement::new());
    let registeree = orchestrator(
        Role::Registeree,
        SubmissionPath::Relayed,
        registeree_tp,
        settlement.clone(),
    )
    .await;
    let relayer = orchestrator(
        Role::Relayer,
        SubmissionPath::Direct,
        Arc::clone(&relayer_tp) as Arc<dyn PeerTransport>,
        settlement.clone(),
    )
    .await;

    let relayer_accept = Arc::clone(&relayer);
    tokio::spawn(async move {
        let (peer, conn) = relayer_tp.accept().await.unwrap();
        relayer_accept.attach(peer, conn).await;
    });

    registeree
        .pair_with(PeerId::from("relayer-laptop"), form())
        .await
        .unwrap();
    registeree
        .sign_and_dispatch_acknowledgement(137)
        .await
        .unwrap();

    let stage = registeree
        .wait_for_stage(RegistrationStage::GracePeriod)
        .await;
    assert_eq!(stage, RegistrationStage::GracePeriod);

    let record = registeree.record().await;
    assert!(record.acknowledgement_hash.is_some());
}
