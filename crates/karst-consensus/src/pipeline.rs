//! The four-stage block validation pipeline.
//!
//! Stages are linked by bounded channels, so a slow downstream stage
//! throttles its producers. Completion propagates by channel close: when a
//! stage's input closes and its in-flight items drain, the stage returns
//! and its own output closes. A fault anywhere records the first error and
//! cancels the token shared across stages; everyone else stops dequeueing
//! and unwinds.
//!
//! - **Stage A** (sequential): streaming merkle build + repeated-txid
//!   defense.
//! - **Stage B** (sequential): structural rules, sig-op and size budgets,
//!   value accounting.
//! - **Stage C** (parallel): contextual per-transaction rules and the
//!   intra-block double-spend set; emits per-input script work.
//! - **Stage D** (parallel): external script verification.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use karst_core::codec;
use karst_core::constants::{BIP16_SWITCH_TIME, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE};
use karst_core::error::{KarstError, ValidationError, ValidationKind};
use karst_core::merkle::MerkleBuilder;
use karst_core::script::{self, ScriptError, ScriptVerifier, VerifyFlags};
use karst_core::types::{Hash256, Transaction, TxOutputKey, ValidatableTx};
use karst_core::validation;

/// Everything the pipeline needs to know about the block being validated.
#[derive(Clone, Copy, Debug)]
pub struct BlockContext {
    pub block_hash: Hash256,
    pub height: u32,
    /// Header timestamp; gates BIP16 sig-op counting and lock-time checks.
    pub time: u32,
    /// Declared merkle root to check the streamed tree against.
    pub merkle_root: Hash256,
}

/// Aggregates accumulated across the pipeline, consumed by whole-block
/// validation and the chain state manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockTotals {
    pub tx_count: u64,
    /// Canonical encoded block size, var-int tx count included.
    pub block_size: usize,
    pub sig_ops: u32,
    /// Non-coinbase input value.
    pub total_input_value: u64,
    /// Non-coinbase output value.
    pub total_output_value: u64,
    pub total_fees: u64,
    pub coinbase_value: u64,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Worker count for the parallel stages (C and D).
    pub parallelism: usize,
    /// Bounded capacity of each inter-stage channel.
    pub channel_capacity: usize,
    /// Downgrade script failures to warnings (historical-chain fast
    /// replay).
    pub ignore_script_errors: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            channel_capacity: 64,
            ignore_script_errors: false,
        }
    }
}

/// A script verifier that accepts everything. The stand-in for tests and
/// for replaying a historical chain where verdicts are already known.
pub struct AcceptAllScripts;

impl ScriptVerifier for AcceptAllScripts {
    fn verify(
        &self,
        _script_pubkey: &[u8],
        _tx: &Transaction,
        _input_index: usize,
        _script_sig: &[u8],
        _flags: VerifyFlags,
    ) -> Result<(), ScriptError> {
        Ok(())
    }
}

/// Per-input work item for stage D.
struct ScriptJob {
    tx: Arc<Transaction>,
    tx_index: u32,
    input_index: u32,
    prev_script_pubkey: Vec<u8>,
}

type FaultSlot = Arc<Mutex<Option<ValidationError>>>;

/// Record the first fault and cancel every stage.
fn fault_with(fault: &FaultSlot, cancel: &CancellationToken, err: ValidationError) {
    {
        let mut slot = fault.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }
    cancel.cancel();
}

pub struct BlockValidator {
    verifier: Arc<dyn ScriptVerifier>,
    config: PipelineConfig,
}

impl BlockValidator {
    pub fn new(verifier: Arc<dyn ScriptVerifier>, config: PipelineConfig) -> Self {
        Self { verifier, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate a block from an already-materialized transaction list.
    pub async fn validate_txs(
        &self,
        ctx: BlockContext,
        txs: Vec<ValidatableTx>,
        cancel: CancellationToken,
    ) -> Result<BlockTotals, KarstError> {
        let (source_tx, source_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let feeder_cancel = cancel.clone();
        let feeder = tokio::spawn(async move {
            for vtx in txs {
                tokio::select! {
                    _ = feeder_cancel.cancelled() => return,
                    sent = source_tx.send(vtx) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        let result = self.validate(ctx, source_rx, cancel).await;
        feeder.await.expect("pipeline feeder panicked");
        result
    }

    /// Validate a block from a streaming transaction source.
    ///
    /// The source must deliver the block's transactions in declared order;
    /// stages C and D reorder per-transaction work freely.
    pub async fn validate(
        &self,
        ctx: BlockContext,
        source: mpsc::Receiver<ValidatableTx>,
        cancel: CancellationToken,
    ) -> Result<BlockTotals, KarstError> {
        let stage_cancel = cancel.child_token();
        let fault: FaultSlot = Arc::new(Mutex::new(None));
        let parallelism = self.config.parallelism.max(1);
        let capacity = self.config.channel_capacity.max(1);

        let (to_b, from_a) = mpsc::channel(capacity);
        let (to_c, from_b) = mpsc::channel(capacity);
        let (to_d, from_c) = mpsc::channel(capacity);

        let stage_a = tokio::spawn(run_stage_a(
            ctx,
            source,
            to_b,
            stage_cancel.clone(),
            Arc::clone(&fault),
        ));
        let stage_b = tokio::spawn(run_stage_b(
            ctx,
            from_a,
            to_c,
            stage_cancel.clone(),
            Arc::clone(&fault),
        ));

        let from_b = Arc::new(tokio::sync::Mutex::new(from_b));
        let spent: Arc<DashMap<TxOutputKey, u32>> = Arc::new(DashMap::new());
        let mut stage_c = Vec::with_capacity(parallelism);
        for _ in 0..parallelism {
            stage_c.push(tokio::spawn(run_stage_c_worker(
                ctx,
                Arc::clone(&from_b),
                to_d.clone(),
                Arc::clone(&spent),
                stage_cancel.clone(),
                Arc::clone(&fault),
            )));
        }
        drop(to_d);

        let from_c = Arc::new(tokio::sync::Mutex::new(from_c));
        let mut stage_d = Vec::with_capacity(parallelism);
        for _ in 0..parallelism {
            stage_d.push(tokio::spawn(run_stage_d_worker(
                ctx,
                Arc::clone(&from_c),
                Arc::clone(&self.verifier),
                self.config.ignore_script_errors,
                stage_cancel.clone(),
                Arc::clone(&fault),
            )));
        }

        stage_a.await.expect("stage A panicked");
        let mut totals = stage_b.await.expect("stage B panicked");
        for handle in stage_c {
            handle.await.expect("stage C worker panicked");
        }
        for handle in stage_d {
            handle.await.expect("stage D worker panicked");
        }

        if let Some(err) = fault.lock().take() {
            return Err(err.into());
        }
        if cancel.is_cancelled() {
            return Err(KarstError::Cancelled);
        }

        // Per-transaction input >= output held in stage C, so the block
        // aggregate cannot underflow.
        totals.total_fees = totals.total_input_value - totals.total_output_value;
        Ok(totals)
    }
}

/// Stage A: streaming merkle and txid uniqueness.
///
/// A repeated txid sets the `repeated` flag and drains the rest of the
/// input without forwarding — never a structural or double-spend fault,
/// so a block padded with copies of its own tail (CVE-2012-2459) always
/// dies as a merkle mismatch at finalization.
async fn run_stage_a(
    ctx: BlockContext,
    mut source: mpsc::Receiver<ValidatableTx>,
    to_b: mpsc::Sender<ValidatableTx>,
    cancel: CancellationToken,
    fault: FaultSlot,
) {
    let mut builder = MerkleBuilder::new();
    let mut seen: HashSet<Hash256> = HashSet::new();
    let mut repeated = false;

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = source.recv() => item,
        };
        let Some(vtx) = item else { break };

        if repeated {
            continue;
        }
        if !seen.insert(vtx.txid) {
            tracing::warn!(
                block = %ctx.block_hash,
                txid = %vtx.txid,
                "repeated transaction hash, dropping block tail"
            );
            repeated = true;
            continue;
        }

        builder.push(vtx.txid);
        let sent = tokio::select! {
            _ = cancel.cancelled() => return,
            sent = to_b.send(vtx) => sent,
        };
        if sent.is_err() {
            return;
        }
    }

    let computed = builder.finish();
    // A truncated stream that still matches the declared root means the
    // raw block body disagrees with what was validated; it must not
    // commit, and the failure is by contract a merkle mismatch.
    if repeated || computed != ctx.merkle_root {
        fault_with(
            &fault,
            &cancel,
            ValidationError::new(
                ctx.block_hash,
                ValidationKind::MerkleRootMismatch { computed, declared: ctx.merkle_root },
            ),
        );
    }
}

/// Stage B: structural rules and the block-wide budgets.
async fn run_stage_b(
    ctx: BlockContext,
    mut from_a: mpsc::Receiver<ValidatableTx>,
    to_c: mpsc::Sender<ValidatableTx>,
    cancel: CancellationToken,
    fault: FaultSlot,
) -> BlockTotals {
    let mut totals = BlockTotals::default();
    let mut tx_bytes_total = 0usize;
    let p2sh_active = ctx.time >= BIP16_SWITCH_TIME;

    let fail = |fault: &FaultSlot, cancel: &CancellationToken, kind: ValidationKind| {
        fault_with(fault, cancel, ValidationError::new(ctx.block_hash, kind));
    };

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return totals,
            item = from_a.recv() => item,
        };
        let Some(vtx) = item else { break };
        let tx_index = vtx.tx_index;

        if let Err(kind) = validation::validate_tx_structure(tx_index, &vtx.tx) {
            fail(&fault, &cancel, kind);
            return totals;
        }

        totals.tx_count += 1;
        tx_bytes_total += vtx.tx_bytes.len();
        let size =
            codec::HEADER_SIZE + codec::var_int_size(totals.tx_count) + tx_bytes_total;
        totals.block_size = size;
        if size > MAX_BLOCK_SIZE {
            fail(&fault, &cancel, ValidationKind::SizeLimit { size, limit: MAX_BLOCK_SIZE });
            return totals;
        }

        let mut sig_ops = script::legacy_tx_sig_ops(&vtx.tx);
        if p2sh_active {
            sig_ops = sig_ops.saturating_add(script::p2sh_tx_sig_ops(&vtx.tx, &vtx.prev_outputs));
        }
        totals.sig_ops = totals.sig_ops.saturating_add(sig_ops);
        if totals.sig_ops > MAX_BLOCK_SIGOPS {
            fail(
                &fault,
                &cancel,
                ValidationKind::SigOpLimit { count: totals.sig_ops, limit: MAX_BLOCK_SIGOPS },
            );
            return totals;
        }

        if vtx.is_coinbase() {
            match vtx.tx.total_output_value() {
                Some(value) => totals.coinbase_value = value,
                None => {
                    fail(&fault, &cancel, ValidationKind::AccountingOverflow { tx_index });
                    return totals;
                }
            }
            continue;
        }

        let mut input_value = 0u64;
        for prev in &vtx.prev_outputs {
            input_value = match input_value.checked_add(prev.output.value) {
                Some(v) => v,
                None => {
                    fail(&fault, &cancel, ValidationKind::AccountingOverflow { tx_index });
                    return totals;
                }
            };
        }
        let Some(output_value) = vtx.tx.total_output_value() else {
            fail(&fault, &cancel, ValidationKind::AccountingOverflow { tx_index });
            return totals;
        };
        let in_sum = totals.total_input_value.checked_add(input_value);
        let out_sum = totals.total_output_value.checked_add(output_value);
        match (in_sum, out_sum) {
            (Some(i), Some(o)) => {
                totals.total_input_value = i;
                totals.total_output_value = o;
            }
            _ => {
                fail(&fault, &cancel, ValidationKind::AccountingOverflow { tx_index });
                return totals;
            }
        }

        let sent = tokio::select! {
            _ = cancel.cancelled() => return totals,
            sent = to_c.send(vtx) => sent,
        };
        if sent.is_err() {
            return totals;
        }
    }
    totals
}

/// Stage C: contextual transaction rules, parallel across workers.
async fn run_stage_c_worker(
    ctx: BlockContext,
    from_b: Arc<tokio::sync::Mutex<mpsc::Receiver<ValidatableTx>>>,
    to_d: mpsc::Sender<ScriptJob>,
    spent_in_block: Arc<DashMap<TxOutputKey, u32>>,
    cancel: CancellationToken,
    fault: FaultSlot,
) {
    loop {
        let item = {
            let mut rx = from_b.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                item = rx.recv() => item,
            }
        };
        let Some(vtx) = item else { return };

        // Prev-outputs already consumed by this block, in any worker.
        for input in &vtx.tx.inputs {
            if spent_in_block.insert(input.prev_output, vtx.tx_index).is_some() {
                fault_with(
                    &fault,
                    &cancel,
                    ValidationError::new(
                        ctx.block_hash,
                        ValidationKind::DoubleSpendWithinBlock(input.prev_output),
                    ),
                );
                return;
            }
        }

        if let Err(kind) = validation::validate_tx_context(&vtx, ctx.height, ctx.time) {
            fault_with(&fault, &cancel, ValidationError::new(ctx.block_hash, kind));
            return;
        }

        for (input_index, _) in vtx.tx.inputs.iter().enumerate() {
            let job = ScriptJob {
                tx: Arc::clone(&vtx.tx),
                tx_index: vtx.tx_index,
                input_index: input_index as u32,
                prev_script_pubkey: vtx.prev_outputs[input_index].output.script_pubkey.clone(),
            };
            let sent = tokio::select! {
                _ = cancel.cancelled() => return,
                sent = to_d.send(job) => sent,
            };
            if sent.is_err() {
                return;
            }
        }
    }
}

/// Stage D: external script verification, parallel across workers.
async fn run_stage_d_worker(
    ctx: BlockContext,
    from_c: Arc<tokio::sync::Mutex<mpsc::Receiver<ScriptJob>>>,
    verifier: Arc<dyn ScriptVerifier>,
    ignore_script_errors: bool,
    cancel: CancellationToken,
    fault: FaultSlot,
) {
    let flags = VerifyFlags { p2sh: ctx.time >= BIP16_SWITCH_TIME };
    loop {
        let job = {
            let mut rx = from_c.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { return };

        let script_sig = &job.tx.inputs[job.input_index as usize].script_sig;
        if let Err(err) =
            verifier.verify(&job.prev_script_pubkey, &job.tx, job.input_index as usize, script_sig, flags)
        {
            if ignore_script_errors {
                tracing::warn!(
                    block = %ctx.block_hash,
                    tx_index = job.tx_index,
                    input = job.input_index,
                    error = %err,
                    "ignoring script failure"
                );
                continue;
            }
            fault_with(
                &fault,
                &cancel,
                ValidationError::new(
                    ctx.block_hash,
                    ValidationKind::ScriptInvalid {
                        tx_index: job.tx_index,
                        input_index: job.input_index,
                    },
                ),
            );
            return;
        }
    }
}
