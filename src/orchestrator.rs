//! Two-phase registration orchestrator.
//!
//! Drives one claim through `FormEntry -> SigningAck ->
//! (SubmittingAck|RelayingAck) -> GracePeriod -> SigningReg ->
//! (SubmittingReg|RelayingReg) -> Complete`, with `Failed` reachable from the
//! signing/submitting/relaying stages. The same type serves both roles: the
//! registeree signs and (on the relayed path) waits for receipts, the relayer
//! submits whatever signatures arrive and relays the resulting hashes back.
//!
//! Shared state is single-writer: only the stage currently in control writes
//! a given field, and transition guards reject anything out of order.

use std::sync::{Arc, Weak};

use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfirmationConfig, RetryConfig, Role};
use crate::confirmation::{
    claim_id, ConfirmationPoller, ConfirmationSnapshot, ConfirmationStatus,
};
use crate::error::{RegistryError, SettlementError};
use crate::merkle::{validate_batch, MerkleTree};
use crate::network::channel::{drain_connection, PeerChannel};
use crate::network::dedup::DedupFilter;
use crate::network::handler::{handler_fn, HandlerRegistry};
use crate::network::message::{
    BatchFields, ConnectPayload, MessageKind, PartnerInfo, PeerMessage, ReceiptPayload,
    SignaturePayload, TxRelayPayload,
};
use crate::network::reliable::{DeliveryState, MessageSink, ReliableSender};
use crate::network::session::SessionState;
use crate::network::transport::PeerConnection;
use crate::settlement::{
    AcknowledgementParams, DeadlineWindow, RegistrationParams, SettlementClient, SignatureParts,
};
use crate::signer::DigestSigner;
use crate::store::SignatureStore;
use crate::types::{
    namespaced_chain_id, short_hash, ChainId, ClaimForm, Hash256, PeerId, RegistrationRecord,
    RegistrationStep, SignatureRecord,
};

/// Where this session is in the two-phase flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationStage {
    FormEntry,
    SigningAck,
    SubmittingAck,
    RelayingAck,
    GracePeriod,
    SigningReg,
    SubmittingReg,
    RelayingReg,
    Complete,
    Failed,
}

impl RegistrationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStage::FormEntry => "FormEntry",
            RegistrationStage::SigningAck => "SigningAck",
            RegistrationStage::SubmittingAck => "SubmittingAck",
            RegistrationStage::RelayingAck => "RelayingAck",
            RegistrationStage::GracePeriod => "GracePeriod",
            RegistrationStage::SigningReg => "SigningReg",
            RegistrationStage::SubmittingReg => "SubmittingReg",
            RegistrationStage::RelayingReg => "RelayingReg",
            RegistrationStage::Complete => "Complete",
            RegistrationStage::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for RegistrationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Valid stage transitions. Everything else is rejected with state unchanged.
fn can_transition(from: RegistrationStage, to: RegistrationStage) -> bool {
    use RegistrationStage::*;
    matches!(
        (from, to),
        (FormEntry, SigningAck)
            | (SigningAck, SubmittingAck)
            | (SigningAck, RelayingAck)
            // Send or submit failure returns the user to signing
            | (SubmittingAck, SigningAck)
            | (RelayingAck, SigningAck)
            | (SubmittingAck, GracePeriod)
            | (RelayingAck, GracePeriod)
            | (GracePeriod, SigningReg)
            | (SigningReg, SubmittingReg)
            | (SigningReg, RelayingReg)
            | (SubmittingReg, SigningReg)
            | (RelayingReg, SigningReg)
            | (SubmittingReg, Complete)
            | (RelayingReg, Complete)
            // Failed is reachable from any signing/submitting/relaying stage
            | (SigningAck, Failed)
            | (SubmittingAck, Failed)
            | (RelayingAck, Failed)
            | (GracePeriod, Failed)
            | (SigningReg, Failed)
            | (SubmittingReg, Failed)
            | (RelayingReg, Failed)
            // Window expiry restarts from acknowledgement
            | (Failed, SigningAck)
            // Reset
            | (FormEntry, FormEntry)
            | (SigningAck, FormEntry)
            | (SubmittingAck, FormEntry)
            | (RelayingAck, FormEntry)
            | (GracePeriod, FormEntry)
            | (SigningReg, FormEntry)
            | (SubmittingReg, FormEntry)
            | (RelayingReg, FormEntry)
            | (Complete, FormEntry)
            | (Failed, FormEntry)
    )
}

/// Direct: this process submits its own transactions. Relayed: the partner
/// submits and relays the hash back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionPath {
    Direct,
    Relayed,
}

/// Final result once `Complete` is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistrationOutcome {
    /// False when the canonical-chain confirmation timed out; the claim may
    /// still settle later and is recoverable out of band.
    pub verified: bool,
}

/// Deterministic content hash for a non-batch claim. Both parties derive it
/// from the shared form, so their claim ids agree.
pub fn claim_content_hash(form: &ClaimForm) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(b"claim");
    hasher.update(form.compromised_address.as_bytes());
    hasher.update(form.recipient_address.as_bytes());
    hasher.update(namespaced_chain_id(form.reported_chain_id).as_bytes());
    hasher.finalize().into()
}

pub struct RegistrationOrchestrator {
    role: Role,
    path: SubmissionPath,
    canonical_chain_id: ChainId,
    confirmation_config: ConfirmationConfig,

    channel: Arc<PeerChannel>,
    registry: Arc<HandlerRegistry>,
    settlement: Arc<dyn SettlementClient>,
    signer: Arc<dyn DigestSigner>,

    signatures: SignatureStore,
    record: RwLock<RegistrationRecord>,
    form: RwLock<Option<ClaimForm>>,
    batch: RwLock<Option<MerkleTree>>,

    stage_tx: watch::Sender<RegistrationStage>,
    last_error: RwLock<Option<RegistryError>>,
    outcome: RwLock<Option<RegistrationOutcome>>,

    relay_dedup: DedupFilter,
    hash_relay: ReliableSender,
    poller: Mutex<Option<ConfirmationPoller>>,
    /// Connections that already have a dispatch task (by pointer identity)
    drained: parking_lot::Mutex<std::collections::HashSet<usize>>,
    session_token: CancellationToken,
    /// Back-reference for handler closures and spawned watchers
    weak: Weak<RegistrationOrchestrator>,
}

impl RegistrationOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        role: Role,
        path: SubmissionPath,
        canonical_chain_id: ChainId,
        confirmation_config: ConfirmationConfig,
        retry_config: RetryConfig,
        channel: Arc<PeerChannel>,
        settlement: Arc<dyn SettlementClient>,
        signer: Arc<dyn DigestSigner>,
    ) -> Arc<RegistrationOrchestrator> {
        let session_token = CancellationToken::new();
        let hash_relay = ReliableSender::new(
            Arc::clone(&channel) as Arc<dyn MessageSink>,
            retry_config,
            session_token.clone(),
        );
        let (stage_tx, _) = watch::channel(RegistrationStage::FormEntry);

        let orchestrator = Arc::new_cyclic(|weak| RegistrationOrchestrator {
            role,
            path,
            canonical_chain_id,
            confirmation_config,
            channel,
            registry: Arc::new(HandlerRegistry::new()),
            settlement,
            signer,
            signatures: SignatureStore::new(),
            record: RwLock::new(RegistrationRecord::default()),
            form: RwLock::new(None),
            batch: RwLock::new(None),
            stage_tx,
            last_error: RwLock::new(None),
            outcome: RwLock::new(None),
            relay_dedup: DedupFilter::new(),
            hash_relay,
            poller: Mutex::new(None),
            drained: parking_lot::Mutex::new(std::collections::HashSet::new()),
            session_token,
            weak: weak.clone(),
        });

        orchestrator.install_default_handlers().await;

        // Exhausted hash-relay delivery surfaces as a session error; the
        // kept message stays available for a manual resend
        let weak = Arc::downgrade(&orchestrator);
        let mut delivery_rx = orchestrator.hash_relay.subscribe();
        tokio::spawn(async move {
            while delivery_rx.changed().await.is_ok() {
                let state = delivery_rx.borrow().clone();
                if let DeliveryState::Failed { attempts } = state {
                    let Some(orchestrator) = weak.upgrade() else { break };
                    *orchestrator.last_error.write().await =
                        Some(RegistryError::RetriesExhausted { attempts });
                }
            }
        });

        orchestrator
    }

    /// A strong handle to self. Infallible while any borrow of self exists,
    /// since a borrow implies a live strong reference.
    fn strong(&self) -> Arc<RegistrationOrchestrator> {
        self.weak.upgrade().expect("orchestrator still referenced")
    }

    // ---- observers -------------------------------------------------------

    pub fn stage(&self) -> RegistrationStage {
        *self.stage_tx.borrow()
    }

    pub fn subscribe_stage(&self) -> watch::Receiver<RegistrationStage> {
        self.stage_tx.subscribe()
    }

    pub async fn wait_for_stage(&self, want: RegistrationStage) -> RegistrationStage {
        let mut rx = self.stage_tx.subscribe();
        loop {
            let current = *rx.borrow();
            if current == want || current == RegistrationStage::Failed {
                return current;
            }
            if rx.changed().await.is_err() {
                return self.stage();
            }
        }
    }

    pub async fn last_error(&self) -> Option<RegistryError> {
        self.last_error.read().await.clone()
    }

    pub async fn outcome(&self) -> Option<RegistrationOutcome> {
        *self.outcome.read().await
    }

    pub async fn record(&self) -> RegistrationRecord {
        self.record.read().await.clone()
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn hash_relay(&self) -> &ReliableSender {
        &self.hash_relay
    }

    pub fn role(&self) -> Role {
        self.role
    }

    // ---- stage machinery -------------------------------------------------

    fn try_transition(&self, to: RegistrationStage) -> Result<(), RegistryError> {
        let mut result = Ok(());
        self.stage_tx.send_if_modified(|stage| {
            if can_transition(*stage, to) {
                debug!("stage: {} -> {}", stage, to);
                *stage = to;
                true
            } else {
                warn!("invalid stage transition {} -> {}", stage, to);
                result = Err(RegistryError::InvalidTransition {
                    from: stage.as_str().to_string(),
                    to: to.as_str().to_string(),
                });
                false
            }
        });
        result
    }

    fn require_stage(&self, want: RegistrationStage) -> Result<(), RegistryError> {
        let current = self.stage();
        if current == want {
            Ok(())
        } else {
            Err(RegistryError::InvalidTransition {
                from: current.as_str().to_string(),
                to: want.as_str().to_string(),
            })
        }
    }

    async fn fail(&self, error: RegistryError) {
        warn!("registration failed: {}", error);
        *self.last_error.write().await = Some(error);
        let _ = self.try_transition(RegistrationStage::Failed);
    }

    // ---- pairing ---------------------------------------------------------

    /// Dial the partner, exchange Connect, and advance out of `FormEntry`.
    pub async fn pair_with(
        &self,
        partner: PeerId,
        form: ClaimForm,
    ) -> Result<(), RegistryError> {
        *self.form.write().await = Some(form.clone());

        let conn = self.channel.dial(&partner).await?;
        self.spawn_drain(Arc::clone(&conn));

        let connect = PeerMessage::Connect(ConnectPayload {
            form,
            p2p: PartnerInfo {
                partner_peer_id: self.channel.local_peer_id(),
            },
        });
        self.channel.send_on(&conn, &connect).await?;
        self.channel.with_session(|s| s.sent_connect = true).await;

        self.try_transition(RegistrationStage::SigningAck)?;
        info!("paired with {} as {}", partner, self.role);
        Ok(())
    }

    /// Adopt a connection the transport accepted and start dispatching its
    /// messages.
    pub async fn attach(&self, peer: PeerId, conn: Arc<dyn PeerConnection>) {
        self.channel.adopt(peer, Arc::clone(&conn)).await;
        self.spawn_drain(conn);
    }

    fn spawn_drain(&self, conn: Arc<dyn PeerConnection>) {
        // One dispatch task per connection, no matter how many times the
        // connection is dialed or attached
        let key = Arc::as_ptr(&conn) as *const () as usize;
        if !self.drained.lock().insert(key) {
            return;
        }

        let orchestrator = self.strong();
        let token = self.session_token.clone();
        tokio::spawn(async move {
            let channel = Arc::clone(&orchestrator.channel);
            let drain = drain_connection(&channel, conn, |message| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    if let Err(e) = orchestrator.registry.dispatch(message).await {
                        warn!("handler error: {}", e);
                    }
                }
            });
            tokio::select! {
                _ = token.cancelled() => {}
                _ = drain => {}
            }
        });
    }

    // ---- acknowledgement phase ------------------------------------------

    /// Sign the acknowledgement and either submit it (direct) or hand it to
    /// the partner (relayed). Nonce and deadline are re-fetched immediately
    /// before signing; cached values are never reused.
    pub async fn sign_and_dispatch_acknowledgement(
        &self,
        chain_id: ChainId,
    ) -> Result<(), RegistryError> {
        self.require_stage(RegistrationStage::SigningAck)?;
        let form = self.claim_form().await?;

        let nonce = self
            .settlement
            .nonce(&form.compromised_address)
            .await
            .map_err(convert_settlement)?;
        let mut params = AcknowledgementParams {
            compromised_address: form.compromised_address.clone(),
            recipient_address: form.recipient_address.clone(),
            chain_id,
            nonce,
            deadline: 0,
        };
        let hash_struct = self
            .settlement
            .acknowledgement_hash_struct(&params)
            .await
            .map_err(convert_settlement)?;
        params.deadline = hash_struct.deadline;

        let signature = self.signer.sign_digest(&hash_struct.digest).await?;

        self.signatures.put(SignatureRecord::new(
            form.compromised_address.clone(),
            chain_id,
            RegistrationStep::Acknowledgement,
            signature.clone(),
            nonce,
            hash_struct.deadline,
            form.reported_chain_id,
            form.incident_timestamp,
        ));

        match self.path {
            SubmissionPath::Direct => {
                self.try_transition(RegistrationStage::SubmittingAck)?;
                self.submit_acknowledgement(&params, &signature).await
            }
            SubmissionPath::Relayed => {
                self.try_transition(RegistrationStage::RelayingAck)?;
                let payload = SignaturePayload {
                    value: signature,
                    deadline: hash_struct.deadline,
                    nonce,
                    address: form.compromised_address.clone(),
                    chain_id,
                    key_ref: self.signer.key_ref(),
                    reported_chain_id: form.reported_chain_id,
                    incident_timestamp: form.incident_timestamp,
                    batch: None,
                };
                if let Err(e) = self
                    .channel
                    .send_to_partner(&PeerMessage::AckSig(payload))
                    .await
                {
                    // Nothing in flight; return to signing so the user can retry
                    let _ = self.try_transition(RegistrationStage::SigningAck);
                    return Err(e);
                }
                debug!("acknowledgement signature sent; awaiting receipt");
                Ok(())
            }
        }
    }

    async fn submit_acknowledgement(
        &self,
        params: &AcknowledgementParams,
        signature: &[u8],
    ) -> Result<(), RegistryError> {
        let parts = SignatureParts::from_packed(signature).map_err(convert_settlement)?;
        match self.settlement.submit_acknowledgement(params, &parts).await {
            Ok(receipt) => {
                info!(
                    "acknowledgement submitted: {}",
                    short_hash(&receipt.tx_hash)
                );
                self.acknowledgement_confirmed(receipt.tx_hash, params.chain_id)
                    .await
            }
            Err(SettlementError::StaleDeadline) => {
                let error = RegistryError::StaleDeadline {
                    step: RegistrationStep::Acknowledgement,
                };
                *self.last_error.write().await = Some(error.clone());
                let _ = self.try_transition(RegistrationStage::SigningAck);
                Err(error)
            }
            Err(e) => {
                // Submission sub-state failure: the signature is preserved and
                // retry_submission() repeats the submit alone
                let error = convert_settlement(e);
                *self.last_error.write().await = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Record the confirmed acknowledgement and open the grace period. On the
    /// relayed path this fires from the `AckPay` handler; the registeree
    /// never observes the submission chain itself.
    async fn acknowledgement_confirmed(
        &self,
        tx_hash: Hash256,
        chain_id: ChainId,
    ) -> Result<(), RegistryError> {
        {
            let mut record = self.record.write().await;
            record.acknowledgement_hash = Some(tx_hash);
            record.acknowledgement_chain_id = Some(chain_id);
        }
        self.try_transition(RegistrationStage::GracePeriod)?;

        // The acknowledgement signature is spent
        if let Some(form) = self.form.read().await.as_ref() {
            self.signatures.remove(
                &form.compromised_address,
                chain_id,
                RegistrationStep::Acknowledgement,
            );
        }
        info!("grace period opened; awaiting start block");
        Ok(())
    }

    // ---- grace period ----------------------------------------------------

    /// Read the grace-window boundaries from the contract and advance when
    /// the window opens. Boundaries are never computed locally: block-time
    /// drift between devices would split the two parties' views.
    pub async fn check_grace_window(&self) -> Result<DeadlineWindow, RegistryError> {
        self.require_stage(RegistrationStage::GracePeriod)?;
        let form = self.claim_form().await?;

        let window = self
            .settlement
            .deadlines(&form.compromised_address)
            .await
            .map_err(convert_settlement)?;

        if window.has_closed() {
            warn!(
                "⏰ registration window expired at block {} (expiry {})",
                window.current_block, window.expiry_block
            );
            let error = RegistryError::WindowExpired {
                current_block: window.current_block,
                expiry_block: window.expiry_block,
            };
            self.fail(error.clone()).await;
            return Err(error);
        }
        if window.is_open() {
            self.try_transition(RegistrationStage::SigningReg)?;
            info!(
                "registration window open at block {} (expires {})",
                window.current_block, window.expiry_block
            );
        }
        Ok(window)
    }

    /// Poll the window until it opens or expires.
    pub async fn wait_for_grace_window(
        &self,
        poll_interval: std::time::Duration,
    ) -> Result<(), RegistryError> {
        loop {
            self.check_grace_window().await?;
            match self.stage() {
                RegistrationStage::SigningReg => return Ok(()),
                RegistrationStage::GracePeriod => {}
                other => {
                    return Err(RegistryError::InvalidTransition {
                        from: other.as_str().to_string(),
                        to: RegistrationStage::SigningReg.as_str().to_string(),
                    })
                }
            }
            tokio::select! {
                _ = self.session_token.cancelled() => {
                    return Err(RegistryError::Connection("session torn down".to_string()));
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// After `WindowExpired`, drop acknowledgement progress and start over
    /// from the signing stage.
    pub async fn restart_acknowledgement(&self) -> Result<(), RegistryError> {
        self.require_stage(RegistrationStage::Failed)?;
        self.record.write().await.clear_acknowledgement();
        *self.last_error.write().await = None;
        self.try_transition(RegistrationStage::SigningAck)
    }

    // ---- registration phase ---------------------------------------------

    /// Sign the registration (optionally over a transaction batch) and either
    /// submit or relay it.
    pub async fn sign_and_dispatch_registration(
        &self,
        chain_id: ChainId,
        tx_hashes: Vec<Hash256>,
        tx_chain_ids: Vec<ChainId>,
    ) -> Result<(), RegistryError> {
        self.require_stage(RegistrationStage::SigningReg)?;
        let form = self.claim_form().await?;

        // Batch input is validated before any network or contract call
        let batch_root = if tx_hashes.is_empty() && tx_chain_ids.is_empty() {
            *self.batch.write().await = None;
            None
        } else {
            let leaves = validate_batch(&tx_hashes, &tx_chain_ids)?;
            let tree = MerkleTree::build(&leaves)
                .ok_or_else(|| RegistryError::InvalidBatch("empty batch".to_string()))?;
            let root = tree.root();
            *self.batch.write().await = Some(tree);
            Some(root)
        };

        let nonce = self
            .settlement
            .nonce(&form.compromised_address)
            .await
            .map_err(convert_settlement)?;
        let mut params = RegistrationParams {
            compromised_address: form.compromised_address.clone(),
            recipient_address: form.recipient_address.clone(),
            chain_id,
            nonce,
            deadline: 0,
            reported_chain_id: form.reported_chain_id,
            incident_timestamp: form.incident_timestamp,
            batch_root,
            tx_hashes: tx_hashes.clone(),
            tx_chain_ids: tx_chain_ids.clone(),
        };
        let hash_struct = self
            .settlement
            .registration_hash_struct(&params)
            .await
            .map_err(convert_settlement)?;
        params.deadline = hash_struct.deadline;

        let signature = self.signer.sign_digest(&hash_struct.digest).await?;

        self.signatures.put(SignatureRecord::new(
            form.compromised_address.clone(),
            chain_id,
            RegistrationStep::Registration,
            signature.clone(),
            nonce,
            hash_struct.deadline,
            form.reported_chain_id,
            form.incident_timestamp,
        ));
        self.record.write().await.content_hash =
            Some(batch_root.unwrap_or_else(|| claim_content_hash(&form)));

        match self.path {
            SubmissionPath::Direct => {
                self.try_transition(RegistrationStage::SubmittingReg)?;
                self.submit_registration(&params, &signature).await
            }
            SubmissionPath::Relayed => {
                self.try_transition(RegistrationStage::RelayingReg)?;
                let payload = SignaturePayload {
                    value: signature,
                    deadline: hash_struct.deadline,
                    nonce,
                    address: form.compromised_address.clone(),
                    chain_id,
                    key_ref: self.signer.key_ref(),
                    reported_chain_id: form.reported_chain_id,
                    incident_timestamp: form.incident_timestamp,
                    batch: batch_root.map(|_| BatchFields {
                        tx_hashes,
                        tx_chain_ids,
                    }),
                };
                if let Err(e) = self
                    .channel
                    .send_to_partner(&PeerMessage::RegSig(payload))
                    .await
                {
                    let _ = self.try_transition(RegistrationStage::SigningReg);
                    return Err(e);
                }
                debug!("registration signature sent; awaiting receipt");
                Ok(())
            }
        }
    }

    async fn submit_registration(
        &self,
        params: &RegistrationParams,
        signature: &[u8],
    ) -> Result<(), RegistryError> {
        let parts = SignatureParts::from_packed(signature).map_err(convert_settlement)?;
        match self.settlement.submit_registration(params, &parts).await {
            Ok(receipt) => {
                info!("registration submitted: {}", short_hash(&receipt.tx_hash));
                self.registration_confirmed(receipt.tx_hash, params.chain_id, receipt.message_id)
                    .await
            }
            Err(SettlementError::StaleDeadline) => {
                let error = RegistryError::StaleDeadline {
                    step: RegistrationStep::Registration,
                };
                *self.last_error.write().await = Some(error.clone());
                let _ = self.try_transition(RegistrationStage::SigningReg);
                Err(error)
            }
            Err(e) => {
                let error = convert_settlement(e);
                *self.last_error.write().await = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Retry a failed submission with the stored signature. Only the
    /// submission sub-state resets; nothing is re-signed.
    pub async fn retry_submission(&self) -> Result<(), RegistryError> {
        let form = self.claim_form().await?;
        match self.stage() {
            RegistrationStage::SubmittingAck => {
                let record = self.stored_signature(&form, RegistrationStep::Acknowledgement)?;
                let params = AcknowledgementParams {
                    compromised_address: record.address.clone(),
                    recipient_address: form.recipient_address.clone(),
                    chain_id: record.chain_id,
                    nonce: record.nonce,
                    deadline: record.deadline,
                };
                self.submit_acknowledgement(&params, &record.signature).await
            }
            RegistrationStage::SubmittingReg => {
                let record = self.stored_signature(&form, RegistrationStep::Registration)?;
                let (batch_root, tx_hashes, tx_chain_ids) = {
                    let batch = self.batch.read().await;
                    match batch.as_ref() {
                        Some(tree) => (
                            Some(tree.root()),
                            tree.leaves().iter().map(|l| l.tx_hash).collect(),
                            tree.leaves().iter().map(|l| l.chain_id).collect(),
                        ),
                        None => (None, Vec::new(), Vec::new()),
                    }
                };
                let params = RegistrationParams {
                    compromised_address: record.address.clone(),
                    recipient_address: form.recipient_address.clone(),
                    chain_id: record.chain_id,
                    nonce: record.nonce,
                    deadline: record.deadline,
                    reported_chain_id: record.reported_chain_id,
                    incident_timestamp: record.incident_timestamp,
                    batch_root,
                    tx_hashes,
                    tx_chain_ids,
                };
                self.submit_registration(&params, &record.signature).await
            }
            other => Err(RegistryError::InvalidTransition {
                from: other.as_str().to_string(),
                to: "retry".to_string(),
            }),
        }
    }

    /// Record the confirmed registration. On a canonical-chain submission the
    /// claim completes verified immediately; otherwise the confirmation
    /// poller decides between verified and unverified completion.
    async fn registration_confirmed(
        &self,
        tx_hash: Hash256,
        chain_id: ChainId,
        message_id: Option<Hash256>,
    ) -> Result<(), RegistryError> {
        let content_hash = {
            let mut record = self.record.write().await;
            record.registration_hash = Some(tx_hash);
            record.registration_chain_id = Some(chain_id);
            record.bridge_message_id = message_id;
            if record.content_hash.is_none() {
                // The relayer reaches here without having signed; derive the
                // same content hash from the shared form or relayed batch
                let batch = self.batch.read().await;
                let form = self.form.read().await;
                record.content_hash = match (batch.as_ref(), form.as_ref()) {
                    (Some(tree), _) => Some(tree.root()),
                    (None, Some(form)) => Some(claim_content_hash(form)),
                    (None, None) => None,
                };
            }
            record
                .content_hash
                .ok_or_else(|| RegistryError::Submission("no content hash".to_string()))?
        };

        if chain_id == self.canonical_chain_id {
            self.complete(RegistrationOutcome { verified: true }).await;
            return Ok(());
        }

        // Non-canonical submission: completion waits for the cross-chain
        // confirmation outcome
        let form = self.claim_form().await?;
        let claim = claim_id(&content_hash, &form.compromised_address, form.reported_chain_id);
        let poller = ConfirmationPoller::spawn(
            Arc::clone(&self.settlement),
            self.confirmation_config,
            claim,
            &self.session_token,
        );
        let snapshots = poller.subscribe();
        *self.poller.lock().await = Some(poller);

        let orchestrator = self.strong();
        tokio::spawn(async move {
            orchestrator.watch_confirmation(snapshots).await;
        });
        Ok(())
    }

    async fn watch_confirmation(
        self: Arc<Self>,
        mut snapshots: watch::Receiver<ConfirmationSnapshot>,
    ) {
        loop {
            let status = snapshots.borrow().status;
            match status {
                ConfirmationStatus::Confirmed => {
                    if self.stage() == RegistrationStage::Complete {
                        // Late confirmation after an unverified completion
                        self.outcome
                            .write()
                            .await
                            .replace(RegistrationOutcome { verified: true });
                        info!("late canonical confirmation; claim now verified");
                    } else {
                        self.complete(RegistrationOutcome { verified: true }).await;
                    }
                    return;
                }
                ConfirmationStatus::Timeout if self.stage() != RegistrationStage::Complete => {
                    // Soft timeout: complete unverified, keep watching for a
                    // late confirmation
                    let elapsed_ms = snapshots.borrow().elapsed_ms;
                    *self.last_error.write().await =
                        Some(RegistryError::CrossChainTimeout { elapsed_ms });
                    self.complete(RegistrationOutcome { verified: false }).await;
                }
                _ => {}
            }
            if snapshots.changed().await.is_err() {
                return;
            }
        }
    }

    async fn complete(&self, outcome: RegistrationOutcome) {
        *self.outcome.write().await = Some(outcome);
        if self.try_transition(RegistrationStage::Complete).is_ok() {
            // Signature records are cleared on success
            self.signatures.clear();
            info!(
                "✅ registration complete ({})",
                if outcome.verified {
                    "verified"
                } else {
                    "unverified"
                }
            );
        }
    }

    // ---- reset / teardown ------------------------------------------------

    /// Cancel background timers and pollers, clear session state, return to
    /// `FormEntry`. The orchestrator can pair again afterwards.
    pub async fn reset(&self) {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.stop();
        }
        self.hash_relay.cancel_pending().await;
        self.signatures.clear();
        self.record.write().await.clear();
        *self.form.write().await = None;
        *self.batch.write().await = None;
        *self.last_error.write().await = None;
        *self.outcome.write().await = None;
        self.relay_dedup.clear().await;
        self.drained.lock().clear();
        self.channel.shutdown().await;
        let _ = self.try_transition(RegistrationStage::FormEntry);
        info!("session reset");
    }

    /// Final teardown: kills every background task spawned by this session.
    /// The orchestrator is unusable afterwards.
    pub fn shutdown(&self) {
        self.session_token.cancel();
    }

    // ---- handlers --------------------------------------------------------

    async fn install_default_handlers(&self) {
        // Handlers hold a weak back-reference; a handler firing after
        // teardown is a no-op instead of a leak
        macro_rules! install {
            ($kind:expr, $variant:path, $method:ident $(, $extra:expr)?) => {{
                let weak = self.weak.clone();
                self.registry
                    .register(
                        $kind,
                        handler_fn(move |message| {
                            let weak = weak.clone();
                            async move {
                                let Some(orchestrator) = weak.upgrade() else {
                                    return Ok(());
                                };
                                match message {
                                    $variant(payload) => {
                                        orchestrator.$method($($extra,)? payload).await
                                    }
                                    _ => Ok(()),
                                }
                            }
                        }),
                    )
                    .await;
            }};
        }

        install!(MessageKind::Connect, PeerMessage::Connect, on_connect);

        match self.role {
            Role::Registeree => {
                install!(
                    MessageKind::AckRec,
                    PeerMessage::AckRec,
                    on_receipt,
                    RegistrationStep::Acknowledgement
                );
                install!(
                    MessageKind::RegRec,
                    PeerMessage::RegRec,
                    on_receipt,
                    RegistrationStep::Registration
                );
                install!(
                    MessageKind::AckPay,
                    PeerMessage::AckPay,
                    on_relayed_hash,
                    RegistrationStep::Acknowledgement
                );
                install!(
                    MessageKind::RegPay,
                    PeerMessage::RegPay,
                    on_relayed_hash,
                    RegistrationStep::Registration
                );
            }
            Role::Relayer => {
                install!(
                    MessageKind::AckSig,
                    PeerMessage::AckSig,
                    on_signature,
                    RegistrationStep::Acknowledgement
                );
                install!(
                    MessageKind::RegSig,
                    PeerMessage::RegSig,
                    on_signature,
                    RegistrationStep::Registration
                );
            }
        }
    }

    /// Both roles: record the partner, store the exchanged form, reply with
    /// our own Connect exactly once, and advance out of `FormEntry`.
    async fn on_connect(&self, payload: ConnectPayload) -> Result<(), RegistryError> {
        let partner = payload.p2p.partner_peer_id.clone();
        let accepted = self
            .channel
            .with_session(|s| {
                let ok = s.set_partner(partner.clone());
                if ok && !s.state().is_connected() {
                    s.try_transition(SessionState::Connected);
                }
                ok
            })
            .await;
        if !accepted {
            warn!("ignoring Connect from {}: already paired", partner);
            return Ok(());
        }

        {
            let mut form = self.form.write().await;
            if form.is_none() {
                *form = Some(payload.form.clone());
            }
        }

        let reply_needed = self
            .channel
            .with_session(|s| {
                if s.sent_connect {
                    false
                } else {
                    s.sent_connect = true;
                    true
                }
            })
            .await;
        if reply_needed {
            let form = self.claim_form().await?;
            let reply = PeerMessage::Connect(ConnectPayload {
                form,
                p2p: PartnerInfo {
                    partner_peer_id: self.channel.local_peer_id(),
                },
            });
            self.channel.send_to(&partner, &reply).await?;
        }

        if self.stage() == RegistrationStage::FormEntry {
            self.try_transition(RegistrationStage::SigningAck)?;
        }
        info!("session connected to {}", partner);
        Ok(())
    }

    /// Registeree: receipt for a signature we relayed. Success is merely the
    /// partner acknowledging storage; progress still waits for the `*Pay`.
    /// Failure surfaces the sanitized reason and returns to signing.
    async fn on_receipt(
        &self,
        step: RegistrationStep,
        payload: ReceiptPayload,
    ) -> Result<(), RegistryError> {
        if payload.success {
            debug!("{} receipt: {}", step, payload.message);
            return Ok(());
        }

        warn!("{} rejected by relayer: {}", step, payload.message);
        let error = RegistryError::Submission(payload.message);
        *self.last_error.write().await = Some(error.clone());
        let back_to = match step {
            RegistrationStep::Acknowledgement => RegistrationStage::SigningAck,
            RegistrationStep::Registration => RegistrationStage::SigningReg,
        };
        let _ = self.try_transition(back_to);
        Err(error)
    }

    /// Registeree: the relayer's confirmed transaction hash. Deduplicated, so
    /// a redundant retry cannot advance or mutate the session twice.
    async fn on_relayed_hash(
        &self,
        step: RegistrationStep,
        payload: TxRelayPayload,
    ) -> Result<(), RegistryError> {
        let mut key = Vec::with_capacity(41);
        key.push(match step {
            RegistrationStep::Acknowledgement => 0x01,
            RegistrationStep::Registration => 0x02,
        });
        key.extend_from_slice(&payload.hash);
        key.extend_from_slice(&payload.tx_chain_id.to_be_bytes());
        if self.relay_dedup.check_and_insert(&key).await {
            debug!("duplicate {} relay for {} dropped", step, short_hash(&payload.hash));
            return Ok(());
        }

        match step {
            RegistrationStep::Acknowledgement => {
                self.require_stage(RegistrationStage::RelayingAck)?;
                self.acknowledgement_confirmed(payload.hash, payload.tx_chain_id)
                    .await
            }
            RegistrationStep::Registration => {
                self.require_stage(RegistrationStage::RelayingReg)?;
                if let Some(message_id) = payload.message_id {
                    self.record.write().await.bridge_message_id = Some(message_id);
                }
                self.registration_confirmed(
                    payload.hash,
                    payload.tx_chain_id,
                    payload.message_id,
                )
                .await
            }
        }
    }

    /// Relayer: a signed authorization arrived. Store it, acknowledge
    /// receipt, submit, and relay the resulting hash back reliably.
    async fn on_signature(
        &self,
        step: RegistrationStep,
        payload: SignaturePayload,
    ) -> Result<(), RegistryError> {
        let form = self.claim_form().await?;

        self.signatures.put(SignatureRecord::new(
            payload.address.clone(),
            payload.chain_id,
            step,
            payload.value.clone(),
            payload.nonce,
            payload.deadline,
            payload.reported_chain_id,
            payload.incident_timestamp,
        ));
        self.send_receipt(step, true, "signature stored").await?;

        let submitted = match step {
            RegistrationStep::Acknowledgement => {
                self.try_transition(RegistrationStage::SubmittingAck)?;
                let params = AcknowledgementParams {
                    compromised_address: payload.address.clone(),
                    recipient_address: form.recipient_address.clone(),
                    chain_id: payload.chain_id,
                    nonce: payload.nonce,
                    deadline: payload.deadline,
                };
                let parts =
                    SignatureParts::from_packed(&payload.value).map_err(convert_settlement)?;
                self.settlement
                    .submit_acknowledgement(&params, &parts)
                    .await
            }
            RegistrationStep::Registration => {
                // The relayer tracks the same grace gate; the contract is the
                // final arbiter either way
                if self.stage() == RegistrationStage::GracePeriod {
                    self.try_transition(RegistrationStage::SigningReg)?;
                }
                self.try_transition(RegistrationStage::SubmittingReg)?;

                let (batch_root, tx_hashes, tx_chain_ids) = match &payload.batch {
                    Some(batch) => {
                        let leaves = validate_batch(&batch.tx_hashes, &batch.tx_chain_ids)?;
                        let tree = MerkleTree::build(&leaves).ok_or_else(|| {
                            RegistryError::InvalidBatch("empty batch".to_string())
                        })?;
                        let root = tree.root();
                        *self.batch.write().await = Some(tree);
                        (
                            Some(root),
                            batch.tx_hashes.clone(),
                            batch.tx_chain_ids.clone(),
                        )
                    }
                    None => (None, Vec::new(), Vec::new()),
                };

                let params = RegistrationParams {
                    compromised_address: payload.address.clone(),
                    recipient_address: form.recipient_address.clone(),
                    chain_id: payload.chain_id,
                    nonce: payload.nonce,
                    deadline: payload.deadline,
                    reported_chain_id: payload.reported_chain_id,
                    incident_timestamp: payload.incident_timestamp,
                    batch_root,
                    tx_hashes,
                    tx_chain_ids,
                };
                let parts =
                    SignatureParts::from_packed(&payload.value).map_err(convert_settlement)?;
                self.settlement.submit_registration(&params, &parts).await
            }
        };

        match submitted {
            Ok(receipt) => {
                info!(
                    "{} submitted for partner: {}",
                    step,
                    short_hash(&receipt.tx_hash)
                );
                let relay = TxRelayPayload {
                    hash: receipt.tx_hash,
                    tx_chain_id: payload.chain_id,
                    message_id: receipt.message_id,
                };
                match step {
                    RegistrationStep::Acknowledgement => {
                        self.acknowledgement_confirmed(receipt.tx_hash, payload.chain_id)
                            .await?;
                        // Losing this message strands the registeree; it goes
                        // through the reliable sender
                        self.hash_relay.deliver(PeerMessage::AckPay(relay)).await;
                    }
                    RegistrationStep::Registration => {
                        self.registration_confirmed(
                            receipt.tx_hash,
                            payload.chain_id,
                            receipt.message_id,
                        )
                        .await?;
                        self.hash_relay.deliver(PeerMessage::RegPay(relay)).await;
                    }
                }
                Ok(())
            }
            Err(e) => {
                let error = convert_settlement(e);
                warn!("{} submission failed: {}", step, error);
                *self.last_error.write().await = Some(error.clone());
                let back_to = match step {
                    RegistrationStep::Acknowledgement => RegistrationStage::SigningAck,
                    RegistrationStep::Registration => RegistrationStage::SigningReg,
                };
                let _ = self.try_transition(back_to);
                // Sanitized reason goes back to the registeree
                self.send_receipt(step, false, &sanitize(&error)).await?;
                Err(error)
            }
        }
    }

    async fn send_receipt(
        &self,
        step: RegistrationStep,
        success: bool,
        message: &str,
    ) -> Result<(), RegistryError> {
        let payload = ReceiptPayload {
            success,
            message: message.to_string(),
        };
        let receipt = match step {
            RegistrationStep::Acknowledgement => PeerMessage::AckRec(payload),
            RegistrationStep::Registration => PeerMessage::RegRec(payload),
        };
        self.channel.send_to_partner(&receipt).await
    }

    // ---- helpers ---------------------------------------------------------

    async fn claim_form(&self) -> Result<ClaimForm, RegistryError> {
        self.form
            .read()
            .await
            .clone()
            .ok_or_else(|| RegistryError::Signing("no claim form for this session".to_string()))
    }

    fn stored_signature(
        &self,
        form: &ClaimForm,
        step: RegistrationStep,
    ) -> Result<SignatureRecord, RegistryError> {
        self.signatures
            .find(&form.compromised_address, step)
            .ok_or(RegistryError::MissingSignature { step })
    }
}

fn convert_settlement(error: SettlementError) -> RegistryError {
    match error {
        SettlementError::StaleDeadline => RegistryError::Submission(
            "deadline expired on contract".to_string(),
        ),
        SettlementError::Rejected(message) => RegistryError::Submission(message),
        SettlementError::Transport(message) => RegistryError::Connection(message),
    }
}

/// Strip anything that is not safe to show the other party.
fn sanitize(error: &RegistryError) -> String {
    match error {
        RegistryError::Submission(message) => message.clone(),
        RegistryError::Connection(_) => "chain temporarily unreachable".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryHub;
    use crate::settlement_mock::MockSettlement;
    use crate::signer::MockSigner;

    fn form() -> ClaimForm {
        ClaimForm {
            compromised_address: "0xvictim".to_string(),
            recipient_address: "0xsafe".to_string(),
            reported_chain_id: 1,
            incident_timestamp: 1_700_000_000,
        }
    }

    async fn direct_orchestrator(
        canonical_chain_id: ChainId,
    ) -> (Arc<RegistrationOrchestrator>, Arc<MockSettlement>) {
        let hub = MemoryHub::new();
        let transport = Arc::new(hub.endpoint(PeerId::from("solo")).await);
        let channel = PeerChannel::new(transport);
        let settlement = Arc::new(MockSettlement::new());

        let orchestrator = RegistrationOrchestrator::new(
            Role::Registeree,
            SubmissionPath::Direct,
            canonical_chain_id,
            ConfirmationConfig::default(),
            RetryConfig::default(),
            channel,
            settlement.clone() as Arc<dyn SettlementClient>,
            Arc::new(MockSigner::new("wallet-0")),
        )
        .await;

        // Direct path needs no partner; seed the form and enter SigningAck
        *orchestrator.form.write().await = Some(form());
        orchestrator
            .try_transition(RegistrationStage::SigningAck)
            .unwrap();
        (orchestrator, settlement)
    }

    #[test]
    fn test_transition_table_rejects_skips() {
        use RegistrationStage::*;
        assert!(!can_transition(FormEntry, GracePeriod));
        assert!(!can_transition(SigningAck, GracePeriod));
        assert!(!can_transition(GracePeriod, SubmittingReg));
        assert!(!can_transition(GracePeriod, Complete));
        assert!(!can_transition(Complete, SigningAck));
        assert!(!can_transition(FormEntry, Failed));

        assert!(can_transition(GracePeriod, SigningReg));
        assert!(can_transition(Failed, SigningAck));
        assert!(can_transition(Complete, FormEntry));
    }

    #[test]
    fn test_claim_content_hash_deterministic() {
        assert_eq!(claim_content_hash(&form()), claim_content_hash(&form()));

        let mut other = form();
        other.recipient_address = "0xelse".to_string();
        assert_ne!(claim_content_hash(&form()), claim_content_hash(&other));
    }

    #[tokio::test]
    async fn test_direct_ack_opens_grace_period() {
        let (orchestrator, _settlement) = direct_orchestrator(137).await;

        orchestrator
            .sign_and_dispatch_acknowledgement(137)
            .await
            .unwrap();

        assert_eq!(orchestrator.stage(), RegistrationStage::GracePeriod);
        let record = orchestrator.record().await;
        assert!(record.acknowledgement_hash.is_some());
        assert_eq!(record.acknowledgement_chain_id, Some(137));
        // The acknowledgement signature is spent
        assert!(orchestrator.signatures.is_empty());
    }

    #[tokio::test]
    async fn test_signing_reg_unreachable_before_start_block() {
        let (orchestrator, settlement) = direct_orchestrator(137).await;
        orchestrator
            .sign_and_dispatch_acknowledgement(137)
            .await
            .unwrap();

        // current_block < start_block: the stage must not move
        let window = orchestrator.check_grace_window().await.unwrap();
        assert!(window.current_block < window.start_block);
        assert_eq!(orchestrator.stage(), RegistrationStage::GracePeriod);

        // Signing the registration now is rejected outright
        let err = orchestrator
            .sign_and_dispatch_registration(137, vec![], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));

        // Window opens: now the stage advances
        settlement.advance_blocks(20);
        orchestrator.check_grace_window().await.unwrap();
        assert_eq!(orchestrator.stage(), RegistrationStage::SigningReg);
    }

    #[tokio::test]
    async fn test_window_expiry_is_terminal_and_restartable() {
        let (orchestrator, settlement) = direct_orchestrator(137).await;
        orchestrator
            .sign_and_dispatch_acknowledgement(137)
            .await
            .unwrap();

        // Blow straight past the expiry block
        settlement.advance_blocks(500);
        let err = orchestrator.check_grace_window().await.unwrap_err();
        assert!(matches!(err, RegistryError::WindowExpired { .. }));
        assert_eq!(orchestrator.stage(), RegistrationStage::Failed);

        // Restart drops acknowledgement progress, back to signing
        orchestrator.restart_acknowledgement().await.unwrap();
        assert_eq!(orchestrator.stage(), RegistrationStage::SigningAck);
        let record = orchestrator.record().await;
        assert!(record.acknowledgement_hash.is_none());
    }

    #[tokio::test]
    async fn test_direct_registration_on_canonical_chain_completes_verified() {
        let (orchestrator, settlement) = direct_orchestrator(137).await;
        orchestrator
            .sign_and_dispatch_acknowledgement(137)
            .await
            .unwrap();
        settlement.advance_blocks(20);
        orchestrator.check_grace_window().await.unwrap();

        orchestrator
            .sign_and_dispatch_registration(137, vec![[1u8; 32]], vec![137])
            .await
            .unwrap();

        assert_eq!(orchestrator.stage(), RegistrationStage::Complete);
        assert_eq!(
            orchestrator.outcome().await,
            Some(RegistrationOutcome { verified: true })
        );
        let record = orchestrator.record().await;
        assert!(record.registration_hash.is_some());
        // Content hash is the batch root for a batched claim
        assert!(record.content_hash.is_some());
        assert!(orchestrator.signatures.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_canonical_completion_waits_for_poller() {
        // Submissions land on chain 137 while chain 1 is canonical
        let (orchestrator, settlement) = direct_orchestrator(1).await;
        orchestrator
            .sign_and_dispatch_acknowledgement(137)
            .await
            .unwrap();
        settlement.advance_blocks(20);
        orchestrator.check_grace_window().await.unwrap();

        orchestrator
            .sign_and_dispatch_registration(137, vec![], vec![])
            .await
            .unwrap();
        // Not complete yet: the canonical chain has not confirmed
        assert_eq!(orchestrator.stage(), RegistrationStage::SubmittingReg);

        // Settle the claim on the canonical chain; the poller notices
        let claim = claim_id(&claim_content_hash(&form()), "0xvictim", 1);
        settlement.settle_claim(claim);

        orchestrator.wait_for_stage(RegistrationStage::Complete).await;
        assert_eq!(
            orchestrator.outcome().await,
            Some(RegistrationOutcome { verified: true })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_canonical_timeout_completes_unverified() {
        let (orchestrator, settlement) = direct_orchestrator(1).await;
        orchestrator
            .sign_and_dispatch_acknowledgement(137)
            .await
            .unwrap();
        settlement.advance_blocks(20);
        orchestrator.check_grace_window().await.unwrap();

        orchestrator
            .sign_and_dispatch_registration(137, vec![], vec![])
            .await
            .unwrap();

        // Never settled on the canonical chain: timeout, then unverified
        orchestrator.wait_for_stage(RegistrationStage::Complete).await;
        assert_eq!(
            orchestrator.outcome().await,
            Some(RegistrationOutcome { verified: false })
        );
        assert!(matches!(
            orchestrator.last_error().await,
            Some(RegistryError::CrossChainTimeout { .. })
        ));

        // A late settlement still flips the outcome to verified
        let claim = claim_id(&claim_content_hash(&form()), "0xvictim", 1);
        settlement.settle_claim(claim);
        let mut verified = false;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            if orchestrator.outcome().await == Some(RegistrationOutcome { verified: true }) {
                verified = true;
                break;
            }
        }
        assert!(verified, "late confirmation never surfaced");
    }

    #[tokio::test]
    async fn test_submission_failure_preserves_signature_for_retry() {
        let (orchestrator, settlement) = direct_orchestrator(137).await;
        settlement.fail_next_submit(SettlementError::Rejected("wallet declined".to_string()));

        let err = orchestrator
            .sign_and_dispatch_acknowledgement(137)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Submission(_)));
        assert_eq!(orchestrator.stage(), RegistrationStage::SubmittingAck);
        assert_eq!(orchestrator.signatures.len(), 1);

        // Retry submits the stored signature without re-signing
        orchestrator.retry_submission().await.unwrap();
        assert_eq!(orchestrator.stage(), RegistrationStage::GracePeriod);
    }

    #[tokio::test]
    async fn test_reset_returns_to_form_entry() {
        let (orchestrator, _settlement) = direct_orchestrator(137).await;
        orchestrator
            .sign_and_dispatch_acknowledgement(137)
            .await
            .unwrap();
        assert_eq!(orchestrator.stage(), RegistrationStage::GracePeriod);

        orchestrator.reset().await;
        assert_eq!(orchestrator.stage(), RegistrationStage::FormEntry);
        assert!(orchestrator.signatures.is_empty());
        assert!(orchestrator.record().await.acknowledgement_hash.is_none());
        assert!(orchestrator.outcome().await.is_none());
    }

    #[tokio::test]
    async fn test_batch_validation_fails_fast() {
        let (orchestrator, settlement) = direct_orchestrator(137).await;
        orchestrator
            .sign_and_dispatch_acknowledgement(137)
            .await
            .unwrap();
        settlement.advance_blocks(20);
        orchestrator.check_grace_window().await.unwrap();

        let submissions_before = settlement.submission_count();
        let err = orchestrator
            .sign_and_dispatch_registration(137, vec![[1u8; 32], [2u8; 32]], vec![137])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidBatch(_)));
        // Failed before any contract call
        assert_eq!(settlement.submission_count(), submissions_before);
        assert_eq!(orchestrator.stage(), RegistrationStage::SigningReg);
    }
}
