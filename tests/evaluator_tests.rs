//! Integration tests for the single-episode driver
//!
//! Runs the evaluator against the deterministic corridor environment and
//! checks the CSV and JSON artifacts it leaves behind.

mod common;

use common::{corridor_config, write_demo, CorridorFactory, ScriptedAgent};
use game_bench::evaluator::{episode_artifact_path, EpisodeLog};
use game_bench::Evaluator;
use serde_json::json;
use tempfile::tempdir;

// ============================================================================
// STEP LOOP
// ============================================================================

#[tokio::test]
async fn test_invalid_action_falls_back_to_default() {
    let out = tempdir().unwrap();
    let factory = CorridorFactory::new(20);
    let config = corridor_config("crafter", &["corridor"], 1, 0);
    let evaluator = Evaluator::new("crafter", config, factory, out.path(), out.path()).unwrap();

    let mut agent = ScriptedAgent::new(&["jump", "right", "right"]);
    let log = evaluator.run_episode("corridor", &mut agent, 0, None).await.unwrap();

    assert!(log.done);
    assert_eq!(log.num_steps, 3);
    assert_eq!(log.episode_return, 1.0);
    assert_eq!(log.failed_candidates, 1);
    assert_eq!(log.action_frequency.get("wait"), Some(&1));
    assert_eq!(log.action_frequency.get("right"), Some(&2));
    assert!(!log.action_frequency.contains_key("jump"));

    // The agent sees its own raw completions as the previous action
    assert_eq!(
        agent.prev_actions,
        vec![None, Some("jump".to_string()), Some("right".to_string())]
    );
}

#[tokio::test]
async fn test_action_frequency_sums_to_num_steps() {
    let out = tempdir().unwrap();
    let factory = CorridorFactory::new(50);
    let mut config = corridor_config("crafter", &["corridor"], 1, 1);
    config.eval.max_steps_per_episode = Some(9);
    let evaluator = Evaluator::new("crafter", config, factory, out.path(), out.path()).unwrap();

    let mut agent = ScriptedAgent::new(&["left", "fly", "wait", "left", "sing", "wait"]);
    let log = evaluator.run_episode("corridor", &mut agent, 0, None).await.unwrap();

    assert!(!log.done);
    assert_eq!(log.num_steps, 9);
    let total: u64 = log.action_frequency.values().sum();
    assert_eq!(total, log.num_steps as u64);
    assert_eq!(log.failed_candidates, 2);
    assert_eq!(log.input_tokens, 90);
    assert_eq!(log.output_tokens, 18);
}

#[tokio::test]
async fn test_environment_step_limit_applies_without_override() {
    let out = tempdir().unwrap();
    let factory = CorridorFactory::new(4);
    let config = corridor_config("crafter", &["corridor"], 1, 0);
    let evaluator = Evaluator::new("crafter", config, factory, out.path(), out.path()).unwrap();

    let mut agent = ScriptedAgent::new(&["wait"]);
    let log = evaluator.run_episode("corridor", &mut agent, 0, None).await.unwrap();
    assert_eq!(log.num_steps, 4);
    assert_eq!(log.episode_return, 0.0);
}

// ============================================================================
// ARTIFACTS
// ============================================================================

#[tokio::test]
async fn test_csv_logs_raw_completion_and_feedback() {
    let out = tempdir().unwrap();
    let factory = CorridorFactory::new(20);
    let config = corridor_config("crafter", &["corridor"], 1, 0);
    let evaluator = Evaluator::new("crafter", config, factory, out.path(), out.path()).unwrap();

    let mut agent = ScriptedAgent::new(&["jump", "right", "right"]);
    evaluator.run_episode("corridor", &mut agent, 2, None).await.unwrap();

    let csv_path = episode_artifact_path(out.path(), "crafter", "corridor", 2, "csv");
    assert!(csv_path.ends_with("crafter/corridor/corridor_run_02.csv"));
    let csv = std::fs::read_to_string(&csv_path).unwrap();

    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("Step,Observation,Action,Reasoning,Reward,Done"));
    assert!(csv.contains("Your previous output action: 'jump' is not a valid action. Defaulted to action: wait"));
    // The raw completion is audited even though `wait` was executed
    assert!(csv.contains("You are at 0. The goal is at 2.\",jump,,0.0,False"));
    assert!(csv.ends_with("2,You are at 2. The goal is at 2.,right,,1.0,True\n"));
}

#[tokio::test]
async fn test_json_artifact_matches_returned_log() {
    let out = tempdir().unwrap();
    let factory = CorridorFactory::new(20);
    let mut config = corridor_config("crafter", &["corridor"], 1, 4);
    config.eval.save_trajectories = true;
    let evaluator = Evaluator::new("crafter", config, factory, out.path(), out.path()).unwrap();

    let mut agent = ScriptedAgent::new(&["sit", "right"]);
    let log = evaluator.run_episode("corridor", &mut agent, 0, Some(3)).await.unwrap();

    let json_path = episode_artifact_path(out.path(), "crafter", "corridor", 0, "json");
    let on_disk: EpisodeLog =
        serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(on_disk.num_steps, log.num_steps);
    assert_eq!(on_disk.seed, 4);
    assert_eq!(on_disk.process_num, Some(3));
    assert_eq!(on_disk.progression(), Some(1.0));
    assert_eq!(on_disk.agent["type"], json!("dummy"));

    let trajectory = on_disk.trajectory.unwrap();
    assert_eq!(trajectory.len(), log.num_steps as usize);
    assert_eq!(
        trajectory[0],
        ("You are at 0. The goal is at 3.".to_string(), "wait".to_string())
    );
}

#[tokio::test]
async fn test_babyai_mission_is_passed_as_instructions() {
    let out = tempdir().unwrap();
    let factory = CorridorFactory::new(5);
    let config = corridor_config("babyai", &["corridor"], 1, 1);
    let evaluator = Evaluator::new("babyai", config, factory, out.path(), out.path()).unwrap();

    let mut agent = ScriptedAgent::new(&["right"]);
    evaluator.run_episode("corridor", &mut agent, 0, None).await.unwrap();
    assert!(agent.instruction_prompt.ends_with(" reach cell 3"));
}

// ============================================================================
// IN-CONTEXT REPLAY
// ============================================================================

#[tokio::test]
async fn test_icl_replay_feeds_demonstrations() {
    let cwd = tempdir().unwrap();
    let out = tempdir().unwrap();
    let records = cwd.path().join("records");
    write_demo(&records, "crafter", "corridor", "corridor_seed_3.json", json!([1, "right"]));
    write_demo(
        &records,
        "crafter",
        "corridor",
        "corridor_seed_10.json",
        json!(["right", 1, null, "left"]),
    );

    let factory = CorridorFactory::new(20);
    let mut config = corridor_config("crafter", &["corridor"], 1, 7);
    config.eval.icl_episodes = 2;
    let evaluator =
        Evaluator::new("crafter", config, factory.clone(), cwd.path(), out.path()).unwrap();

    let mut agent = ScriptedAgent::new(&["right"]).with_icl();
    let log = evaluator.run_episode("corridor", &mut agent, 0, None).await.unwrap();

    // Natural order puts seed_3 before seed_10; replay stops at the null action
    assert_eq!(agent.icl_actions, vec!["right", "right", "right", "right"]);
    assert_eq!(agent.icl_observations[0], "You are at 0. The goal is at 2.");
    assert_eq!(agent.icl_observations[2], "You are at 0. The goal is at 3.");
    assert_eq!(agent.wrapped, 2);
    assert_eq!(log.icl_action_frequency.get("right"), Some(&4));

    // Live counts are kept apart from replayed ones
    let live: u64 = log.action_frequency.values().sum();
    assert_eq!(live, log.num_steps as u64);

    let seeds: Vec<Option<u64>> = factory.made().iter().map(|m| m.seed).collect();
    assert_eq!(seeds, vec![Some(7), Some(3), Some(10)]);
}

#[tokio::test]
async fn test_icl_replay_without_demos_fails_episode() {
    let cwd = tempdir().unwrap();
    let out = tempdir().unwrap();
    let factory = CorridorFactory::new(20);
    let mut config = corridor_config("crafter", &["corridor"], 1, 7);
    config.eval.icl_episodes = 1;
    let evaluator = Evaluator::new("crafter", config, factory, cwd.path(), out.path()).unwrap();

    let mut agent = ScriptedAgent::new(&["right"]).with_icl();
    let err = evaluator
        .run_episode("corridor", &mut agent, 0, None)
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("no demonstration episodes found"));
    assert!(!episode_artifact_path(out.path(), "crafter", "corridor", 0, "json").exists());
}

#[tokio::test]
async fn test_agents_without_icl_skip_replay() {
    let cwd = tempdir().unwrap();
    let out = tempdir().unwrap();
    let factory = CorridorFactory::new(20);
    let mut config = corridor_config("crafter", &["corridor"], 1, 7);
    config.eval.icl_episodes = 3;
    let evaluator =
        Evaluator::new("crafter", config, factory.clone(), cwd.path(), out.path()).unwrap();

    let mut agent = ScriptedAgent::new(&["right"]);
    let log = evaluator.run_episode("corridor", &mut agent, 0, None).await.unwrap();
    assert!(log.icl_action_frequency.is_empty());
    assert_eq!(factory.made().len(), 1);
}
