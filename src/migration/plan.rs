//! Dry-run planning: source analysis, transformation simulation,
//! prerequisite checks and rule-based risk assessment.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::event::Event;
use crate::migration::context::{MigrationContext, MigrationError, MigrationPhase};
use crate::migration::executor::run_pipeline;
use crate::store::DataStore;

/// Shape of the source stream under migration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceAnalysis {
    /// Number of events on the source stream.
    pub event_count: u64,

    /// Events per event-type name.
    pub event_type_distribution: HashMap<String, u64>,
}

/// One simulated transformation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationFailure {
    /// Event type of the failing sample.
    pub event_name: String,

    /// The transformation error message.
    pub error: String,
}

/// Outcome of re-running the transformation pipeline over a sample of
/// source events.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransformationSimulation {
    /// How many events were sampled.
    pub sample_size: u64,

    /// Samples that transformed cleanly.
    pub successful: u64,

    /// Samples whose transformation failed.
    pub failed: u64,

    /// The individual failures.
    pub failures: Vec<SimulationFailure>,
}

/// One prerequisite of the migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisite {
    /// What is required.
    pub name: String,

    /// Whether the requirement is met.
    pub is_met: bool,
}

/// Risk severity buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskSeverity {
    /// Informational.
    Low,
    /// Worth reviewing before execution.
    Medium,
    /// Blocks feasibility.
    High,
}

/// One identified risk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Risk {
    /// Risk category, e.g. `"Data Safety"`.
    pub category: String,

    /// How severe the risk is.
    pub severity: RiskSeverity,

    /// Human-readable description.
    pub description: String,
}

/// The dry-run output: everything a caller needs to decide whether to
/// execute the migration for real.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationPlan {
    /// Shape of the source stream.
    pub source_analysis: SourceAnalysis,

    /// Sampled transformation outcome.
    pub transformation_simulation: TransformationSimulation,

    /// Prerequisite checklist.
    pub prerequisites: Vec<Prerequisite>,

    /// Identified risks.
    pub risks: Vec<Risk>,

    /// True iff no [high-severity][RiskSeverity::High] risk was found.
    pub is_feasible: bool,
}

/// Builds a [`MigrationPlan`] for the given context without writing
/// anything.
pub async fn build_plan(context: &MigrationContext) -> Result<MigrationPlan, MigrationError> {
    let source_events = read_source_events(context).await?;

    let mut distribution: HashMap<String, u64> = HashMap::new();
    for event in &source_events {
        *distribution.entry(event.event_type.clone()).or_default() += 1;
    }

    let source_analysis = SourceAnalysis {
        event_count: source_events.len() as u64,
        event_type_distribution: distribution,
    };

    let transformation_simulation = simulate_transformations(context, &source_events);
    let prerequisites = check_prerequisites(context);
    let risks = assess_risks(context, &prerequisites, &transformation_simulation);

    let is_feasible = !risks
        .iter()
        .any(|risk| risk.severity == RiskSeverity::High);

    debug!(
        migration_id = %context.migration_id,
        events = source_analysis.event_count,
        risks = risks.len(),
        is_feasible,
        "dry-run plan built"
    );

    Ok(MigrationPlan {
        source_analysis,
        transformation_simulation,
        prerequisites,
        risks,
        is_feasible,
    })
}

async fn read_source_events(context: &MigrationContext) -> Result<Vec<Event>, MigrationError> {
    let Some(data_store) = context.data_store.as_ref() else {
        // Planning still works without a data store; the missing store
        // shows up as an unmet prerequisite and a blocking risk.
        return Ok(Vec::new());
    };

    data_store
        .read(&context.source_document, 0, None, None)
        .await
        .map_err(|source| MigrationError::Storage {
            phase: MigrationPhase::Prepare,
            source,
        })
}

fn simulate_transformations(
    context: &MigrationContext,
    source_events: &[Event],
) -> TransformationSimulation {
    if context.transformers.is_empty() || source_events.is_empty() {
        return TransformationSimulation::default();
    }

    let sample_size = context
        .verification_config
        .as_ref()
        .map(|cfg| cfg.transformation_sample_size)
        .unwrap_or(10)
        .min(source_events.len());

    // Seeded by the migration id so a plan is reproducible for its context.
    let mut rng = rand::rngs::StdRng::seed_from_u64(u64::from_le_bytes(
        context.migration_id.as_bytes()[..8]
            .try_into()
            .expect("uuid has at least 8 bytes"),
    ));
    let sample: Vec<&Event> = source_events
        .choose_multiple(&mut rng, sample_size)
        .collect();

    let mut simulation = TransformationSimulation {
        sample_size: sample.len() as u64,
        ..TransformationSimulation::default()
    };

    for event in sample {
        match run_pipeline(&context.transformers, event.clone()) {
            Ok(_) => simulation.successful += 1,
            Err(error) => {
                simulation.failed += 1;
                simulation.failures.push(SimulationFailure {
                    event_name: event.event_type.clone(),
                    error: error.to_string(),
                });
            },
        }
    }

    simulation
}

fn check_prerequisites(context: &MigrationContext) -> Vec<Prerequisite> {
    vec![
        Prerequisite {
            name: "data store configured".to_owned(),
            is_met: context.data_store.is_some(),
        },
        Prerequisite {
            name: "document store configured".to_owned(),
            is_met: context.document_store.is_some(),
        },
        Prerequisite {
            name: "target stream differs from source".to_owned(),
            is_met: context.target_stream_identifier != context.source_stream_identifier,
        },
        Prerequisite {
            name: "source stream is not broken".to_owned(),
            is_met: !context.source_document.active.is_broken,
        },
    ]
}

fn assess_risks(
    context: &MigrationContext,
    prerequisites: &[Prerequisite],
    simulation: &TransformationSimulation,
) -> Vec<Risk> {
    let mut risks = Vec::new();

    if context.backup_config.is_none() {
        risks.push(Risk {
            category: "Data Safety".to_owned(),
            severity: RiskSeverity::High,
            description: "no backup is configured; a failed migration cannot be restored"
                .to_owned(),
        });
    }

    for prerequisite in prerequisites {
        if !prerequisite.is_met {
            risks.push(Risk {
                category: "Configuration".to_owned(),
                severity: RiskSeverity::High,
                description: format!("prerequisite not met: {}", prerequisite.name),
            });
        }
    }

    if simulation.failed > 0 {
        risks.push(Risk {
            category: "Transformation".to_owned(),
            severity: RiskSeverity::Medium,
            description: format!(
                "{} of {} sampled events failed transformation",
                simulation.failed, simulation.sample_size
            ),
        });
    }

    if context.verification_config.is_none() {
        risks.push(Risk {
            category: "Verification".to_owned(),
            severity: RiskSeverity::Low,
            description: "no verification is configured; copy errors would go unnoticed"
                .to_owned(),
        });
    }

    risks
}
