//! MTR命令行主程序

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use mtr_admin::{init_logging, ConfigManager, MtrConfig, StorageBackend};
use mtr_assessment::{AssessmentEngine, AssessmentRequest};
use mtr_core::{
    DrugTherapyProblem, FollowUpType, InterventionCategory, InterventionType, MedicationEntry,
    MtrError, NewFollowUp, NewIntervention, PatientContext, Priority, ProblemType, Severity,
    Urgency,
};
use mtr_workflow::{
    AutosaveSettings, InMemoryGateway, JsonFileGateway, PersistenceGateway, ReviewWorkflow,
};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// MTR命令行参数
#[derive(Parser, Debug)]
#[command(name = "mtr-cli")]
#[command(about = "药物治疗评估 (Medication Therapy Review) 命令行工具")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// 日志级别，覆盖配置文件中的设置
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 对用药清单运行规则评估并输出 JSON 报告
    Assess {
        /// 评估请求 JSON 文件
        #[arg(short, long)]
        input: PathBuf,

        /// 同时运行依从性检查
        #[arg(long)]
        adherence: bool,
    },
    /// 完整执行一次评估流程并输出概要
    Review {
        /// 评估输入 JSON 文件
        #[arg(short, long)]
        input: PathBuf,
    },
}

/// review 子命令的输入
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewInput {
    #[serde(default)]
    patient_id: Option<Uuid>,
    #[serde(default)]
    patient: PatientContext,
    #[serde(default)]
    medications: Vec<MedicationEntry>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = ConfigManager::new(args.config.as_deref());

    // 初始化日志；配置无效时按默认日志设置输出错误
    let logging = loaded
        .as_ref()
        .map(|manager| manager.config().logging.clone())
        .unwrap_or_default();
    init_logging(&logging, args.log_level.as_deref())?;

    let manager = loaded.inspect_err(|e| error!("Failed to load configuration: {:#}", e))?;
    manager.log_summary();
    let config = manager.config().clone();

    let result = match &args.command {
        Command::Assess { input, adherence } => run_assess(input, *adherence).await,
        Command::Review { input } => run_review(&config, input).await,
    };

    if let Err(e) = &result {
        error!("mtr-cli failed: {:#}", e);
    }
    result
}

async fn read_input<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read input file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse input file {}", path.display()))
}

async fn run_assess(input: &Path, adherence: bool) -> Result<()> {
    let request: AssessmentRequest = read_input(input).await?;
    let report = AssessmentEngine::new().assess_request(&request, adherence)?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn build_gateway(config: &MtrConfig) -> Result<Arc<dyn PersistenceGateway>> {
    let gateway: Arc<dyn PersistenceGateway> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(InMemoryGateway::new()),
        StorageBackend::JsonFile => Arc::new(
            JsonFileGateway::open(&config.storage.data_dir)
                .await
                .context("Failed to open session data directory")?,
        ),
    };
    info!("Using {:?} session storage", config.storage.backend);
    Ok(gateway)
}

async fn run_review(config: &MtrConfig, input: &Path) -> Result<()> {
    let input: ReviewInput = read_input(input).await?;
    let gateway = build_gateway(config).await?;

    let workflow = Arc::new(ReviewWorkflow::new(
        gateway,
        AutosaveSettings {
            enabled: config.workflow.autosave_enabled,
            interval: config.workflow.autosave_interval(),
        },
    ));
    let autosave = workflow.spawn_autosave();

    let patient_id = input.patient_id.unwrap_or_else(Uuid::new_v4);
    match workflow.start_review(patient_id).await {
        Ok(_) => {}
        Err(MtrError::Conflict { session_id, .. }) => {
            info!(
                "Patient {} already has review {:?} in progress, resuming",
                patient_id, session_id
            );
            workflow.resume_for_patient(patient_id).await?;
        }
        Err(e) => return Err(e.into()),
    }

    // 患者选择
    workflow
        .complete_step(0, Some(json!({ "patientId": patient_id })))
        .await?;
    workflow.advance().await?;

    // 用药史
    workflow.set_patient_context(input.patient).await?;
    let mut recorded = 0;
    for medication in input.medications {
        let name = medication.drug_name.clone();
        match workflow.add_medication(medication).await {
            Ok(_) => recorded += 1,
            Err(e) => warn!("Medication {:?} not recorded: {}", name, e),
        }
    }
    workflow
        .complete_step(1, Some(json!({ "medicationCount": recorded })))
        .await?;
    workflow.advance().await?;

    // 治疗评估
    let assessment = workflow.run_assessment().await?;
    let adherence = workflow.run_adherence_check().await?;
    let new_problems: Vec<DrugTherapyProblem> = assessment
        .into_new_problems()
        .into_iter()
        .chain(adherence.into_new_problems())
        .collect();
    workflow
        .complete_step(2, Some(json!({ "newProblems": new_problems.len() })))
        .await?;
    workflow.advance().await?;

    // 方案制定
    workflow
        .complete_step(3, Some(json!({ "plannedInterventions": new_problems.len() })))
        .await?;
    workflow.advance().await?;

    // 干预
    let mut planned = Vec::with_capacity(new_problems.len());
    for problem in &new_problems {
        let (priority, urgency) = triage(problem.severity);
        let intervention_id = workflow
            .record_intervention(NewIntervention {
                problem_id: Some(problem.id),
                intervention_type: InterventionType::Recommendation,
                category: intervention_category(problem.problem_type),
                description: format!("Review with prescriber: {}", problem.description),
                rationale: Some(problem.clinical_significance.clone()),
                follow_up_required: true,
                priority,
                urgency,
            })
            .await?;
        planned.push((intervention_id, problem, priority, urgency));
    }
    workflow.complete_step(4, None).await?;
    workflow.advance().await?;

    // 随访
    for (intervention_id, problem, priority, urgency) in planned {
        workflow
            .schedule_follow_up(NewFollowUp {
                intervention_id: Some(intervention_id),
                follow_up_type: follow_up_type(problem.problem_type),
                priority,
                scheduled_date: Utc::now() + follow_up_delay(urgency),
                description: format!("Follow up on: {}", problem.description),
            })
            .await?;
    }
    workflow.complete_step(5, None).await?;

    workflow.save().await?;
    let session_id = workflow.complete_review().await?;
    autosave.stop();

    let summary = workflow.summary().await?;
    let ledger = workflow
        .snapshot()
        .await
        .map(|session| session.ledger)
        .unwrap_or_default();

    info!("Review {} finished", session_id);
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "summary": summary, "ledger": ledger }))?
    );
    Ok(())
}

fn triage(severity: Severity) -> (Priority, Urgency) {
    match severity {
        Severity::Critical => (Priority::High, Urgency::Immediate),
        Severity::Major => (Priority::High, Urgency::Within24Hours),
        Severity::Moderate => (Priority::Medium, Urgency::WithinWeek),
        Severity::Minor => (Priority::Low, Urgency::Routine),
    }
}

fn intervention_category(problem_type: ProblemType) -> InterventionCategory {
    match problem_type {
        ProblemType::DoseTooHigh | ProblemType::DoseTooLow => InterventionCategory::DoseAdjustment,
        ProblemType::Contraindication | ProblemType::WrongDrug => InterventionCategory::Substitution,
        ProblemType::Nonadherence => InterventionCategory::AdherenceSupport,
        ProblemType::Untreated => InterventionCategory::Addition,
        ProblemType::Monitoring => InterventionCategory::LabMonitoring,
        ProblemType::Interaction
        | ProblemType::Duplication
        | ProblemType::Unnecessary
        | ProblemType::AdverseReaction => InterventionCategory::Discontinuation,
    }
}

fn follow_up_type(problem_type: ProblemType) -> FollowUpType {
    match problem_type {
        ProblemType::Nonadherence => FollowUpType::AdherenceCheck,
        ProblemType::DoseTooHigh | ProblemType::DoseTooLow | ProblemType::Monitoring => {
            FollowUpType::LabReview
        }
        _ => FollowUpType::OutcomeAssessment,
    }
}

fn follow_up_delay(urgency: Urgency) -> Duration {
    match urgency {
        Urgency::Immediate => Duration::days(1),
        Urgency::Within24Hours => Duration::days(2),
        Urgency::WithinWeek => Duration::days(7),
        Urgency::Routine => Duration::days(30),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_global_flags() {
        let args = Args::try_parse_from([
            "mtr-cli",
            "assess",
            "--input",
            "meds.json",
            "--adherence",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        match args.command {
            Command::Assess { input, adherence } => {
                assert_eq!(input, PathBuf::from("meds.json"));
                assert!(adherence);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_triage_is_monotonic_in_severity() {
        let mut previous = (Priority::Low, Urgency::Routine);
        for severity in [Severity::Minor, Severity::Moderate, Severity::Major, Severity::Critical] {
            let current = triage(severity);
            assert!(current.0 >= previous.0);
            assert!(current.1 >= previous.1);
            previous = current;
        }
    }

    #[test]
    fn test_review_input_defaults() {
        let input: ReviewInput = serde_json::from_str(r#"{"medications": []}"#).unwrap();
        assert!(input.patient_id.is_none());
        assert!(input.patient.allergies.is_empty());
    }
}
