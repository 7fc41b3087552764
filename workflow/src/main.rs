//! Checkpointed multi-stage workflow controller CLI.
//!
//! Drives a task through planning, human approval, building, review, testing,
//! diagnosis and write-up using the stage commands configured in
//! `.workflow/config.toml`. Every transition is checkpointed under
//! `.workflow/runs/`, so `workflow resume <run-id>` picks up where a run left
//! off.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};

use workflow::approval::ApprovalGate;
use workflow::controller::summarize_runs;
use workflow::core::ids::validate_run_id;
use workflow::core::transitions::TransitionSummary;
use workflow::core::types::{Decision, PipelineConfig, RunStatus, StageTag};
use workflow::exit_codes;
use workflow::io::checkpoint::{CheckpointStore, FileCheckpointStore};
use workflow::io::config::{WorkflowConfig, load_config};
use workflow::io::init::{InitOptions, WorkflowPaths, init_workflow};
use workflow::io::rules::load_rules;
use workflow::io::stage_command::command_stages;
use workflow::logging;
use workflow::state::RunState;
use workflow::{Controller, PipelineError, RunOutcome};

#[derive(Parser)]
#[command(
    name = "workflow",
    version,
    about = "Checkpointed plan/approve/build/review/test workflow controller"
)]
struct Cli {
    /// Project root containing `.workflow/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.workflow/` with a default config.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new run for a task and drive it to the approval gate.
    Start {
        /// Task description handed to every stage.
        task: String,
        #[command(flatten)]
        drive: DriveArgs,
    },
    /// Continue a run from its latest checkpoint.
    Resume {
        run_id: String,
        #[command(flatten)]
        drive: DriveArgs,
    },
    /// Approve the plan of a run waiting for approval, then resume it.
    Approve {
        run_id: String,
        /// Record the decision without resuming.
        #[arg(long)]
        no_resume: bool,
        #[command(flatten)]
        drive: DriveArgs,
    },
    /// Reject the plan of a run waiting for approval; the run fails.
    Reject {
        run_id: String,
        /// Reason recorded with the rejection.
        #[arg(long)]
        note: Option<String>,
        /// Record the decision without resuming.
        #[arg(long)]
        no_resume: bool,
    },
    /// List past runs.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Print the full checkpoint of a run.
    Show { run_id: String },
}

#[derive(Args, Clone, Default)]
struct DriveArgs {
    /// Override `max_review_retries` from config.
    #[arg(long)]
    max_review_retries: Option<u32>,
    /// Override `max_debug_retries` from config.
    #[arg(long)]
    max_debug_retries: Option<u32>,
    /// Ask for plan approval on the terminal instead of suspending.
    #[arg(long)]
    interactive: bool,
    /// Print the outcome as JSON.
    #[arg(long)]
    json: bool,
}

impl DriveArgs {
    fn pipeline(&self, cfg: &WorkflowConfig) -> PipelineConfig {
        let mut pipeline = cfg.pipeline();
        if let Some(max) = self.max_review_retries {
            pipeline.max_review_retries = max;
        }
        if let Some(max) = self.max_debug_retries {
            pipeline.max_debug_retries = max;
        }
        pipeline
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = WorkflowPaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Start { task, drive } => cmd_start(&paths, &task, &drive),
        Command::Resume { run_id, drive } => cmd_resume(&paths, &run_id, &drive),
        Command::Approve {
            run_id,
            no_resume,
            drive,
        } => cmd_decide(&paths, &run_id, Decision::Approved, no_resume, &drive),
        Command::Reject {
            run_id,
            note,
            no_resume,
        } => cmd_decide(
            &paths,
            &run_id,
            Decision::Rejected { note },
            no_resume,
            &DriveArgs::default(),
        ),
        Command::List { json } => cmd_list(&paths, json),
        Command::Show { run_id } => cmd_show(&paths, &run_id),
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::AlreadyTerminal {
            status: RunStatus::Failed,
            ..
        }) => exit_codes::FAILED,
        Some(PipelineError::RunBusy { .. }) => exit_codes::BUSY,
        _ => exit_codes::INVALID,
    }
}

fn exit_code_for_outcome(outcome: &RunOutcome) -> i32 {
    match outcome.status {
        RunStatus::Failed => exit_codes::FAILED,
        RunStatus::AwaitingApproval => exit_codes::AWAITING_APPROVAL,
        _ => exit_codes::OK,
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workflow(root, &InitOptions { force })?;
    println!("initialized {}", paths.workflow_dir.display());
    println!(
        "configure stage commands under [stages] in {}",
        paths.config_path.display()
    );
    Ok(exit_codes::OK)
}

struct Session {
    cfg: WorkflowConfig,
    controller: Controller<FileCheckpointStore>,
}

fn open_session(paths: &WorkflowPaths, drive: &DriveArgs) -> Result<Session> {
    let cfg = load_config(&paths.config_path)?;
    let stages = command_stages(&cfg, &paths.root)?;
    let rules = load_rules(cfg.rules_file_in(&paths.root).as_deref())?;
    let store = FileCheckpointStore::new(cfg.checkpoint_dir_in(&paths.root));
    let mut controller = Controller::new(store, stages, rules);
    if drive.interactive {
        controller = controller.with_gate(PromptGate::new(
            std::io::BufReader::new(std::io::stdin()),
            std::io::stderr(),
        ));
    }
    Ok(Session { cfg, controller })
}

fn cmd_start(paths: &WorkflowPaths, task: &str, drive: &DriveArgs) -> Result<i32> {
    let session = open_session(paths, drive)?;
    let outcome = session.controller.start_with(
        task,
        &paths.root,
        &drive.pipeline(&session.cfg),
        report_step,
    )?;
    print_outcome(&outcome, drive.json)
}

fn cmd_resume(paths: &WorkflowPaths, run_id: &str, drive: &DriveArgs) -> Result<i32> {
    let session = open_session(paths, drive)?;
    let outcome = session.controller.resume_with(
        run_id,
        &drive.pipeline(&session.cfg),
        report_step,
    )?;
    print_outcome(&outcome, drive.json)
}

fn cmd_decide(
    paths: &WorkflowPaths,
    run_id: &str,
    decision: Decision,
    no_resume: bool,
    drive: &DriveArgs,
) -> Result<i32> {
    let session = open_session(paths, drive)?;
    session.controller.decide(run_id, decision.clone())?;
    eprintln!("{run_id}: plan {decision}");
    if no_resume {
        return Ok(exit_codes::OK);
    }
    let outcome = session.controller.resume_with(
        run_id,
        &drive.pipeline(&session.cfg),
        report_step,
    )?;
    print_outcome(&outcome, drive.json)
}

fn cmd_list(paths: &WorkflowPaths, json: bool) -> Result<i32> {
    let cfg = load_config(&paths.config_path)?;
    let store = FileCheckpointStore::new(cfg.checkpoint_dir_in(&paths.root));
    let runs = summarize_runs(&store)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&runs).context("serialize run list")?
        );
        return Ok(exit_codes::OK);
    }
    if runs.is_empty() {
        println!("no runs");
        return Ok(exit_codes::OK);
    }
    for run in &runs {
        let failure = run
            .failure
            .as_deref()
            .map(|reason| format!(" ({reason})"))
            .unwrap_or_default();
        println!(
            "{}  {:<17}  {:<17}  {}  {}{failure}",
            run.run_id,
            run.status,
            run.current_stage,
            run.updated_at.format("%Y-%m-%d %H:%M:%S"),
            run.task
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_show(paths: &WorkflowPaths, run_id: &str) -> Result<i32> {
    validate_run_id(run_id).map_err(PipelineError::InvalidInput)?;
    let cfg = load_config(&paths.config_path)?;
    let store = FileCheckpointStore::new(cfg.checkpoint_dir_in(&paths.root));
    let state = store.load(run_id).map_err(PipelineError::from)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&state).context("serialize run state")?
    );
    Ok(exit_codes::OK)
}

fn report_step(summary: &TransitionSummary, state: &RunState) {
    eprintln!(
        "{}: {} -> {} ({})",
        state.run_id, summary.from, summary.to, summary.status
    );
}

fn print_outcome(outcome: &RunOutcome, json: bool) -> Result<i32> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(outcome).context("serialize outcome")?
        );
    } else {
        println!(
            "{}: {} at {}",
            outcome.run_id, outcome.status, outcome.current_stage
        );
        if let Some(reason) = &outcome.failure {
            println!("failure: {reason}");
        }
        if outcome.is_suspended() {
            println!(
                "review the plan with `workflow show {0}`, then `workflow approve {0}` or `workflow reject {0}`",
                outcome.run_id
            );
        }
    }
    Ok(exit_code_for_outcome(outcome))
}

/// Terminal approval prompt, like a human plan review.
///
/// An empty answer or end of input defers the decision.
struct PromptGate<R, W> {
    io: Mutex<(R, W)>,
}

impl<R, W> PromptGate<R, W> {
    fn new(input: R, output: W) -> Self {
        Self {
            io: Mutex::new((input, output)),
        }
    }
}

impl<R: BufRead + Send, W: Write + Send> ApprovalGate for PromptGate<R, W> {
    fn await_approval(&self, state: &RunState) -> Result<Option<Decision>> {
        let mut guard = self
            .io
            .lock()
            .map_err(|_| anyhow!("approval prompt lock poisoned"))?;
        let (input, output) = &mut *guard;

        let plan = state.output(StageTag::Planning).unwrap_or_default();
        writeln!(output, "\n=== plan for {} ===\n{plan}\n", state.run_id)
            .context("write approval prompt")?;
        write!(output, "approve this plan? [a]pprove / [r]eject / [d]efer: ")
            .context("write approval prompt")?;
        output.flush().context("flush approval prompt")?;

        let answer = read_line(input)?.to_lowercase();
        match answer.as_str() {
            "a" | "approve" | "y" | "yes" => Ok(Some(Decision::Approved)),
            "r" | "reject" | "n" | "no" => {
                write!(output, "rejection note (optional): ").context("write note prompt")?;
                output.flush().context("flush note prompt")?;
                let note = read_line(input)?;
                Ok(Some(Decision::Rejected {
                    note: (!note.is_empty()).then_some(note),
                }))
            }
            _ => Ok(None),
        }
    }
}

fn read_line<R: BufRead>(input: &mut R) -> Result<String> {
    let mut line = String::new();
    input.read_line(&mut line).context("read approval answer")?;
    Ok(line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Cursor;

    fn awaiting() -> RunState {
        let mut state = RunState::new(
            "run-1".to_string(),
            "task".to_string(),
            PathBuf::from("/repo"),
            Utc::now(),
        );
        state.status = RunStatus::AwaitingApproval;
        state.current_stage = StageTag::AwaitingApproval;
        state
            .stage_outputs
            .insert(StageTag::Planning, "1. add route".to_string());
        state
    }

    fn ask(answers: &str) -> (Option<Decision>, String) {
        let gate = PromptGate::new(Cursor::new(answers.as_bytes().to_vec()), Vec::new());
        let decision = gate.await_approval(&awaiting()).expect("prompt");
        let (_, output) = gate.io.into_inner().expect("lock");
        (decision, String::from_utf8(output).expect("utf8"))
    }

    #[test]
    fn parse_start_with_overrides() {
        let cli = Cli::parse_from([
            "workflow",
            "start",
            "add login",
            "--max-review-retries",
            "2",
            "--interactive",
        ]);
        match cli.command {
            Command::Start { task, drive } => {
                assert_eq!(task, "add login");
                assert_eq!(drive.max_review_retries, Some(2));
                assert!(drive.interactive);
                let pipeline = drive.pipeline(&WorkflowConfig::default());
                assert_eq!(pipeline.max_review_retries, 2);
                assert_eq!(pipeline.max_debug_retries, 3);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn parse_reject_with_note_and_global_root() {
        let cli = Cli::parse_from([
            "workflow", "reject", "run-1", "--note", "too big", "--root", "/tmp/p",
        ]);
        assert_eq!(cli.root, PathBuf::from("/tmp/p"));
        assert!(matches!(
            cli.command,
            Command::Reject { ref note, no_resume: false, .. } if note.as_deref() == Some("too big")
        ));
    }

    #[test]
    fn prompt_shows_plan_and_approves() {
        let (decision, output) = ask("a\n");
        assert_eq!(decision, Some(Decision::Approved));
        assert!(output.contains("1. add route"));
    }

    #[test]
    fn prompt_rejects_with_note() {
        let (decision, _) = ask("r\nscope too wide\n");
        assert_eq!(
            decision,
            Some(Decision::Rejected {
                note: Some("scope too wide".to_string())
            })
        );
    }

    #[test]
    fn prompt_defers_on_empty_input() {
        assert_eq!(ask("").0, None);
        assert_eq!(ask("\n").0, None);
    }
}
