use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::bail;
use crate::error::{ErrorKind, ShardDdlResult};
use crate::store::keys::{DECISION_PREFIX, KeyAdapter, REPORT_PREFIX, TABLE_SET_PREFIX};
use crate::store::kv::{Compare, KvStore, Revision, Txn};
use crate::types::{ChangeReport, Decision, TableName, TableSet};

/// Attempts of the read-compare-write cycle in [`CoordinationStore::put_decision`].
const MAX_DECISION_WRITE_ATTEMPTS: usize = 8;

/// Change reports by task, source, upstream schema and upstream table.
pub type ReportMap =
    BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, ChangeReport>>>>;

/// Decisions nested like [`ReportMap`].
pub type DecisionMap =
    BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, Decision>>>>;

/// Table sets by task and source.
pub type TableSetMap = BTreeMap<String, BTreeMap<String, TableSet>>;

/// Outcome of [`CoordinationStore::put_decision`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DecisionWrite {
    pub revision: Revision,
    /// `false` when an already settled decision was kept.
    pub written: bool,
    /// Whether a previous decision for the same key was overwritten.
    pub superseded: bool,
}

/// A stored record and the revision it was last written at.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub mod_revision: Revision,
}

/// The change reports of a task addressed to one downstream table, and the decisions
/// answering them.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DownstreamRecords {
    pub reports: Vec<Versioned<ChangeReport>>,
    pub decisions: Vec<Versioned<Decision>>,
}

impl DownstreamRecords {
    /// Returns whether every report has a decision and every decision is settled.
    pub fn all_settled(&self) -> bool {
        self.reports.len() == self.decisions.len()
            && self.decisions.iter().all(|decision| decision.value.settled)
    }
}

/// Typed access to the coordination records kept in a [`KvStore`].
///
/// Every method maps to one store transaction or one prefix read, and returns the store
/// revision it observed. Records written together share that revision.
#[derive(Debug, Clone)]
pub struct CoordinationStore<K> {
    kv: K,
}

impl<K> CoordinationStore<K>
where
    K: KvStore + Send + Sync,
{
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    /// Stores a change report, replacing the previous report for the same upstream table.
    pub async fn put_report(&self, report: &ChangeReport) -> ShardDdlResult<Revision> {
        let txn = Txn::new().put(report_key(report), encode(report)?);

        self.commit(txn).await
    }

    pub async fn get_reports(&self) -> ShardDdlResult<(ReportMap, Revision)> {
        let response = self.kv.range(REPORT_PREFIX.prefix()).await?;

        let mut reports = ReportMap::new();
        for entry in response.entries {
            let [task, source, schema, table] = decode_key::<4>(REPORT_PREFIX, &entry.key)?;
            let report: ChangeReport = decode(&entry.value)?;
            reports
                .entry(task)
                .or_default()
                .entry(source)
                .or_default()
                .entry(schema)
                .or_default()
                .insert(table, report);
        }

        Ok((reports, response.revision))
    }

    /// Returns the change report stored for one upstream table of a source.
    pub async fn get_report(
        &self,
        task: &str,
        source: &str,
        upstream: &TableName,
    ) -> ShardDdlResult<(Option<ChangeReport>, Revision)> {
        let key = REPORT_PREFIX.encode(&[
            task,
            source,
            upstream.schema.as_str(),
            upstream.name.as_str(),
        ]);
        let response = self.kv.range(&key).await?;

        let report = response
            .entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| decode(&entry.value))
            .transpose()?;

        Ok((report, response.revision))
    }

    /// Stores a decision.
    ///
    /// With `skip_settled`, a stored decision for the same key that the source already settled
    /// is kept and nothing is written. The check and the write are one compare-and-swap; it is
    /// retried when another writer touched the key in between.
    pub async fn put_decision(
        &self,
        decision: &Decision,
        skip_settled: bool,
    ) -> ShardDdlResult<DecisionWrite> {
        let key = decision_key(decision);
        let value = encode(decision)?;

        for attempt in 1..=MAX_DECISION_WRITE_ATTEMPTS {
            let response = self.kv.range(&key).await?;
            let existing = response
                .entries
                .into_iter()
                .find(|entry| entry.key == key);

            let mod_revision = match &existing {
                Some(entry) => {
                    let stored: Decision = decode(&entry.value)?;
                    if skip_settled && stored.settled {
                        debug!(decision_id = %stored.id, "keeping settled decision");

                        return Ok(DecisionWrite {
                            revision: response.revision,
                            written: false,
                            superseded: false,
                        });
                    }

                    entry.mod_revision
                }
                None => 0,
            };

            let txn = Txn::new()
                .when(Compare::ModRevision {
                    key: key.clone(),
                    revision: mod_revision,
                })
                .put(key.clone(), value.clone());
            let response = self.kv.txn(txn).await?;

            if response.succeeded {
                return Ok(DecisionWrite {
                    revision: response.revision,
                    written: true,
                    superseded: existing.is_some(),
                });
            }

            warn!(%key, attempt, "decision was modified concurrently, retrying");
        }

        bail!(
            ErrorKind::StoreContention,
            "Decision kept changing while being written",
            format!(
                "gave up writing decision `{}` after {MAX_DECISION_WRITE_ATTEMPTS} attempts",
                decision.id
            )
        );
    }

    /// Marks the stored decision as settled if it is still `decision`.
    ///
    /// Returns `None` without writing when the stored decision for the key has another
    /// identifier or is gone, which happens when a newer cycle replaced it.
    pub async fn settle_decision(&self, decision: &Decision) -> ShardDdlResult<Option<Revision>> {
        let key = decision_key(decision);

        for attempt in 1..=MAX_DECISION_WRITE_ATTEMPTS {
            let response = self.kv.range(&key).await?;
            let Some(entry) = response.entries.into_iter().find(|entry| entry.key == key) else {
                return Ok(None);
            };

            let stored: Decision = decode(&entry.value)?;
            if stored.id != decision.id {
                debug!(
                    decision_id = %decision.id,
                    stored_decision_id = %stored.id,
                    "decision was superseded before it was settled"
                );

                return Ok(None);
            }
            if stored.settled {
                return Ok(Some(response.revision));
            }

            let txn = Txn::new()
                .when(Compare::ModRevision {
                    key: key.clone(),
                    revision: entry.mod_revision,
                })
                .put(key.clone(), encode(&stored.settle())?);
            let response = self.kv.txn(txn).await?;

            if response.succeeded {
                return Ok(Some(response.revision));
            }

            warn!(%key, attempt, "decision was modified concurrently, retrying");
        }

        bail!(
            ErrorKind::StoreContention,
            "Decision kept changing while being settled",
            format!(
                "gave up settling decision `{}` after {MAX_DECISION_WRITE_ATTEMPTS} attempts",
                decision.id
            )
        );
    }

    pub async fn get_decisions(&self) -> ShardDdlResult<(DecisionMap, Revision)> {
        let response = self.kv.range(DECISION_PREFIX.prefix()).await?;

        let mut decisions = DecisionMap::new();
        for entry in response.entries {
            let [task, source, schema, table] = decode_key::<4>(DECISION_PREFIX, &entry.key)?;
            let decision: Decision = decode(&entry.value)?;
            decisions
                .entry(task)
                .or_default()
                .entry(source)
                .or_default()
                .entry(schema)
                .or_default()
                .insert(table, decision);
        }

        Ok((decisions, response.revision))
    }

    /// Deletes reports and decisions in one transaction.
    pub async fn delete_reports_decisions(
        &self,
        reports: &[ChangeReport],
        decisions: &[Decision],
    ) -> ShardDdlResult<Revision> {
        let mut txn = Txn::new();
        for report in reports {
            txn = txn.delete(report_key(report));
        }
        for decision in decisions {
            txn = txn.delete(decision_key(decision));
        }

        self.commit(txn).await
    }

    /// Reads the change reports of `task` addressed to `downstream` and the decisions answering
    /// them, with their mod revisions.
    pub async fn get_downstream_records(
        &self,
        task: &str,
        downstream: &TableName,
    ) -> ShardDdlResult<(DownstreamRecords, Revision)> {
        let reports = self.kv.range(&REPORT_PREFIX.encode(&[task])).await?;
        let decisions = self.kv.range(&DECISION_PREFIX.encode(&[task])).await?;

        let mut records = DownstreamRecords::default();
        for entry in reports.entries {
            let report: ChangeReport = decode(&entry.value)?;
            if report.downstream != *downstream {
                continue;
            }

            let key = report_decision_key(&report);
            if let Some(decision) = decisions.entries.iter().find(|entry| entry.key == key) {
                records.decisions.push(Versioned {
                    value: decode(&decision.value)?,
                    mod_revision: decision.mod_revision,
                });
            }
            records.reports.push(Versioned {
                value: report,
                mod_revision: entry.mod_revision,
            });
        }

        Ok((records, decisions.revision))
    }

    /// Deletes `records` in one transaction, provided none of them was written since they
    /// were read.
    ///
    /// Returns `None` and deletes nothing when any record changed.
    pub async fn delete_downstream_records(
        &self,
        records: &DownstreamRecords,
    ) -> ShardDdlResult<Option<Revision>> {
        let mut txn = Txn::new();
        for report in &records.reports {
            let key = report_key(&report.value);
            txn = txn
                .when(Compare::ModRevision {
                    key: key.clone(),
                    revision: report.mod_revision,
                })
                .delete(key);
        }
        for decision in &records.decisions {
            let key = decision_key(&decision.value);
            txn = txn
                .when(Compare::ModRevision {
                    key: key.clone(),
                    revision: decision.mod_revision,
                })
                .delete(key);
        }

        let response = self.kv.txn(txn).await?;

        Ok(response.succeeded.then_some(response.revision))
    }

    /// Stores a table set and a change report of the same source in one transaction.
    pub async fn put_table_set_report(
        &self,
        table_set: &TableSet,
        report: &ChangeReport,
    ) -> ShardDdlResult<Revision> {
        let txn =
            table_set_op(Txn::new(), table_set)?.put(report_key(report), encode(report)?);

        self.commit(txn).await
    }

    /// Stores a table set and deletes a change report that no longer applies, in one
    /// transaction.
    pub async fn put_table_set_delete_report(
        &self,
        table_set: &TableSet,
        report: &ChangeReport,
    ) -> ShardDdlResult<Revision> {
        let txn = table_set_op(Txn::new(), table_set)?.delete(report_key(report));

        self.commit(txn).await
    }

    /// Stores a table set; a tombstone deletes the stored one.
    pub async fn put_table_set(&self, table_set: &TableSet) -> ShardDdlResult<Revision> {
        let txn = table_set_op(Txn::new(), table_set)?;

        self.commit(txn).await
    }

    pub async fn get_table_sets(&self) -> ShardDdlResult<(TableSetMap, Revision)> {
        let response = self.kv.range(TABLE_SET_PREFIX.prefix()).await?;

        let mut table_sets = TableSetMap::new();
        for entry in response.entries {
            let [task, source] = decode_key::<2>(TABLE_SET_PREFIX, &entry.key)?;
            let table_set: TableSet = decode(&entry.value)?;
            table_sets.entry(task).or_default().insert(source, table_set);
        }

        Ok((table_sets, response.revision))
    }

    /// Removes a source from its task: deletes its table set together with the given reports
    /// and decisions in one transaction.
    pub async fn remove_source(
        &self,
        tombstone: &TableSet,
        reports: &[ChangeReport],
        decisions: &[Decision],
    ) -> ShardDdlResult<Revision> {
        if !tombstone.is_deleted {
            bail!(
                ErrorKind::InvalidState,
                "Removing a source requires a table set tombstone",
                format!(
                    "table set of source `{}` in task `{}` is not marked as deleted",
                    tombstone.source, tombstone.task
                )
            );
        }

        let mut txn = table_set_op(Txn::new(), tombstone)?;
        for report in reports {
            txn = txn.delete(report_key(report));
        }
        for decision in decisions {
            txn = txn.delete(decision_key(decision));
        }

        self.commit(txn).await
    }

    /// Applies an unconditional transaction.
    async fn commit(&self, txn: Txn) -> ShardDdlResult<Revision> {
        let response = self.kv.txn(txn).await?;
        if !response.succeeded {
            bail!(
                ErrorKind::StoreTransactionFailed,
                "Unconditional store transaction was not applied"
            );
        }

        Ok(response.revision)
    }
}

fn report_key(report: &ChangeReport) -> String {
    REPORT_PREFIX.encode(&[
        report.task.as_str(),
        report.source.as_str(),
        report.upstream.schema.as_str(),
        report.upstream.name.as_str(),
    ])
}

fn decision_key(decision: &Decision) -> String {
    DECISION_PREFIX.encode(&[
        decision.task.as_str(),
        decision.source.as_str(),
        decision.upstream.schema.as_str(),
        decision.upstream.name.as_str(),
    ])
}

/// Key of the decision answering `report`.
fn report_decision_key(report: &ChangeReport) -> String {
    DECISION_PREFIX.encode(&[
        report.task.as_str(),
        report.source.as_str(),
        report.upstream.schema.as_str(),
        report.upstream.name.as_str(),
    ])
}

fn table_set_op(txn: Txn, table_set: &TableSet) -> ShardDdlResult<Txn> {
    let key = TABLE_SET_PREFIX.encode(&[table_set.task.as_str(), table_set.source.as_str()]);
    if table_set.is_deleted {
        return Ok(txn.delete(key));
    }

    Ok(txn.put(key, encode(table_set)?))
}

fn decode_key<const N: usize>(adapter: KeyAdapter, key: &str) -> ShardDdlResult<[String; N]> {
    let components = adapter.decode(key)?;
    match <[String; N]>::try_from(components) {
        Ok(components) => Ok(components),
        Err(components) => bail!(
            ErrorKind::InvalidKey,
            "Key has an unexpected number of components",
            format!("key `{key}` has {} components, expected {N}", components.len())
        ),
    }
}

fn encode<T: Serialize>(value: &T) -> ShardDdlResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(value: &[u8]) -> ShardDdlResult<T> {
    Ok(serde_json::from_slice(value)?)
}
