use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use approx::assert_relative_eq;
use phylo_search::checkpoint::{RunCheckpoint, read_checkpoint};
use phylo_search::config::{Config, SearchParams};
use phylo_search::engine::phylogenetic_analysis;
use phylo_search::io::read_tree_file;
use phylo_search::run_log::read_best_score;
use phylo_search::{PhyloError, evaluate, load};

const ALN: &str = ">A\nACGTACGTACGTAAAACCGTACGTTTGA\n\
    >B\nACGTACGTACGAAAAACCGTACGATTGA\n\
    >C\nACGAACTTACGTTAAACCGAACGATTCA\n\
    >D\nACCTACTTACGTTAACCCGAACTATTCA\n\
    >E\nTCCTACTTAGGTTAACCTGATCTAGTCA\n\
    >F\nTCCTACTAAGGTTTACCTGATCTTGTCC\n\
    >G\nTCCTTCTAAGGTTTACCTGTTCTTGACC\n";

fn config(dir: &Path, seed: u64) -> Config {
    let aln = dir.join("tiny.fa");
    fs::write(&aln, ALN).unwrap();
    Config {
        alignment: Some(aln),
        prefix: Some(dir.join("tiny")),
        model: "TEST".to_string(),
        seed,
        search: SearchParams { nstop: 10, nbest: 3, cmin: 2, max_iterations: 30, ..SearchParams::default() },
        ..Config::default()
    }
}

#[test]
fn reported_score_matches_independent_evaluation() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 1);
    let result = phylogenetic_analysis(&cfg, &AtomicBool::new(false)).unwrap();

    let ckp: RunCheckpoint = read_checkpoint(&result.checkpoint_file).unwrap();
    assert_eq!(ckp.log_likelihood, result.log_likelihood);
    assert!(ckp.status.is_finished());

    let aln = load(cfg.alignment.as_ref().unwrap(), None).unwrap();
    let (_, tree) = read_tree_file(&result.tree_file).unwrap().remove(0);
    let recomputed = evaluate(&tree, &ckp.models[0], &aln, cfg.min_branch_length).unwrap();
    assert_relative_eq!(recomputed, result.log_likelihood, max_relative = 1e-3);

    let logged = read_best_score(&result.log_file).unwrap().unwrap();
    assert_relative_eq!(logged, result.log_likelihood, epsilon = 1e-5);
}

#[test]
fn same_seed_same_result() {
    let d1 = tempfile::tempdir().unwrap();
    let d2 = tempfile::tempdir().unwrap();
    let a = phylogenetic_analysis(&config(d1.path(), 4), &AtomicBool::new(false)).unwrap();
    let b = phylogenetic_analysis(&config(d2.path(), 4), &AtomicBool::new(false)).unwrap();
    assert_eq!(a.log_likelihood, b.log_likelihood);
    assert_eq!(a.tree, b.tree);
    assert_eq!(a.models, b.models);
}

#[test]
fn stopped_analysis_resumes_to_uninterrupted_score() {
    let full_dir = tempfile::tempdir().unwrap();
    let full = phylogenetic_analysis(&config(full_dir.path(), 8), &AtomicBool::new(false)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 8);
    let err = phylogenetic_analysis(&cfg, &AtomicBool::new(true)).unwrap_err();
    assert!(matches!(err, PhyloError::Interrupted(_)));
    assert!(!dir.path().join("tiny.treefile").exists());

    let resumed = phylogenetic_analysis(&cfg, &AtomicBool::new(false)).unwrap();
    assert_eq!(resumed.log_likelihood, full.log_likelihood);
    assert_eq!(resumed.tree, full.tree);
}

#[test]
fn analysis_stopped_mid_search_resumes_to_uninterrupted_score() {
    let full_dir = tempfile::tempdir().unwrap();
    let params = SearchParams { checkpoint_interval: 1, ..config(full_dir.path(), 3).search };
    let full_cfg = Config { search: params.clone(), ..config(full_dir.path(), 3) };
    let full = phylogenetic_analysis(&full_cfg, &AtomicBool::new(false)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cfg = Config { search: params, ..config(dir.path(), 3) };
    let ckp_path = dir.path().join("tiny.ckp.gz");
    let stop = AtomicBool::new(false);
    let first = std::thread::scope(|s| {
        let handle = s.spawn(|| phylogenetic_analysis(&cfg, &stop));
        while !handle.is_finished() {
            let reached = read_checkpoint::<RunCheckpoint>(&ckp_path).is_ok_and(|c| c.iteration >= 2);
            if reached {
                stop.store(true, Ordering::SeqCst);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.join().unwrap()
    });

    match first {
        Err(PhyloError::Interrupted(_)) => {
            let ckp: RunCheckpoint = read_checkpoint(&ckp_path).unwrap();
            assert!(ckp.iteration >= 2);
            assert!(!ckp.status.is_finished());
            let resumed = phylogenetic_analysis(&cfg, &AtomicBool::new(false)).unwrap();
            assert!(!resumed.from_checkpoint);
            assert_eq!(resumed.log_likelihood, full.log_likelihood);
            assert_eq!(resumed.tree, full.tree);
        }
        // the search converged before the flag was seen
        Ok(done) => assert_eq!(done.log_likelihood, full.log_likelihood),
        Err(e) => panic!("unexpected error: {e}"),
    }
}
