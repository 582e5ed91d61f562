use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bgg_scraper_lib::{
    DelayPolicy, Dispatcher, Job, Mode, PipelineConfig, RawResponse, RunSummary, Transport,
};

type Reply = Result<RawResponse, String>;
type Hook = Box<dyn Fn(&str) + Send + Sync>;

/// In-memory API: per-id scripted replies, then a fallback reply, and a
/// log of every requested id.
#[derive(Default)]
struct ScriptedApi {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    fallback: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<String>>,
    on_call: Option<Hook>,
}

impl ScriptedApi {
    fn reply(self, id: &str, reply: Reply) -> Self {
        self.fallback.lock().unwrap().insert(id.to_string(), reply);
        self
    }

    fn script(self, id: &str, replies: Vec<Reply>) -> Self {
        self.scripts.lock().unwrap().insert(id.to_string(), replies.into());
        self
    }

    fn on_call(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_call = Some(Box::new(hook));
        self
    }
}

/// Shared so the test keeps a view of the call log after the dispatcher
/// takes ownership of the transport.
struct Shared(Arc<ScriptedApi>);

impl Transport for Shared {
    fn get(&self, url: &str) -> Result<RawResponse, String> {
        let id = url
            .split("id=")
            .nth(1)
            .and_then(|rest| rest.split('&').next())
            .unwrap_or_default()
            .to_string();
        self.0.calls.lock().unwrap().push(id.clone());
        if let Some(hook) = &self.0.on_call {
            hook(&id);
        }
        let scripted = self.0.scripts.lock().unwrap().get_mut(&id).and_then(|q| q.pop_front());
        if let Some(next) = scripted {
            return next;
        }
        self.0
            .fallback
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Err(format!("no reply scripted for {id}")))
    }
}

fn game(id: &str) -> Reply {
    Ok(RawResponse {
        status: 200,
        body: format!(
            r#"<?xml version="1.0" encoding="utf-8"?><items><item type="boardgame" id="{id}"><minplayers value="2"/><link type="boardgamecategory" value="Dice"/><link type="boardgamecategory" value="Bluffing"/></item></items>"#
        )
        .into_bytes(),
    })
}

fn no_item() -> Reply {
    Ok(RawResponse { status: 200, body: br#"<items termsofuse="x"></items>"#.to_vec() })
}

fn status(code: u16) -> Reply {
    Ok(RawResponse { status: code, body: Vec::new() })
}

fn jobs(ids: &[(&str, &str)]) -> Vec<Job> {
    ids.iter()
        .enumerate()
        .map(|(index, (id, name))| Job {
            index,
            external_id: id.to_string(),
            label: name.to_string(),
        })
        .collect()
}

fn abc() -> Vec<Job> {
    jobs(&[("1", "A"), ("2", "B"), ("3", "C")])
}

fn config(dir: &Path, workers: usize) -> PipelineConfig {
    let mut config = PipelineConfig::for_mode(Mode::Details);
    config.input = dir.join("games.csv");
    config.output = dir.join("game_details.csv");
    config.checkpoint = dir.join("checkpoint.json");
    config.workers = workers;
    config.delays = DelayPolicy::immediate();
    config
}

fn run(config: PipelineConfig, api: &Arc<ScriptedApi>, jobs: &[Job]) -> RunSummary {
    let dispatcher = Dispatcher::new(config, Box::new(Shared(api.clone()))).unwrap();
    dispatcher.run(jobs).unwrap()
}

fn rows(path: &Path) -> Vec<Vec<String>> {
    let mut rdr = csv::ReaderBuilder::new().has_headers(false).from_path(path).unwrap();
    rdr.records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect()
}

fn ids(path: &Path) -> Vec<String> {
    let mut ids: Vec<String> = rows(path).into_iter().skip(1).map(|r| r[0].clone()).collect();
    ids.sort();
    ids
}

fn checkpoint(dir: &Path) -> Option<String> {
    fs::read_to_string(dir.join("checkpoint.json")).ok()
}

fn calls(api: &ScriptedApi, id: &str) -> usize {
    api.calls.lock().unwrap().iter().filter(|c| c.as_str() == id).count()
}

#[test]
fn fresh_run_with_rate_limited_job() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(
        ScriptedApi::default()
            .reply("1", game("1"))
            .script("2", vec![status(429), status(429)])
            .reply("2", game("2"))
            .reply("3", game("3")),
    );

    let cfg = config(dir.path(), 3);
    let output = cfg.output.clone();
    let summary = run(cfg, &api, &abc());

    assert_eq!(summary.submitted, 3);
    assert_eq!(summary.processed(), 3);
    assert_eq!(summary.written, 3);
    assert_eq!(summary.last_index, 2);
    assert!(!summary.interrupted);
    assert_eq!(calls(&api, "2"), 3);

    let all = rows(&output);
    assert_eq!(all[0][..3], ["id", "name", "type"]);
    assert_eq!(all.len(), 4);
    assert_eq!(ids(&output), ["1", "2", "3"]);
    let catan = all.iter().find(|r| r[0] == "1").unwrap();
    assert_eq!(catan[1], "A");
    assert_eq!(catan[3], "Dice|Bluffing");
    assert_eq!(checkpoint(dir.path()).as_deref(), Some(r#"{"last_index":2}"#));
}

#[test]
fn resume_submits_only_jobs_after_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 2);
    let header = "id,name,type,category,mechanism,designer,artist,publisher,min_players,max_players,playing_time,min_age,complexity_rating,integrates_with\n";
    fs::write(&cfg.output, format!("{header}1,A,boardgame,Dice,,,,,2,,,,,\n")).unwrap();
    fs::write(&cfg.checkpoint, r#"{"last_index": 0}"#).unwrap();

    let api = Arc::new(ScriptedApi::default().reply("2", game("2")).reply("3", game("3")));
    let output = cfg.output.clone();
    let summary = run(cfg, &api, &abc());

    assert_eq!(summary.submitted, 2);
    assert_eq!(calls(&api, "1"), 0);
    let contents = fs::read_to_string(&output).unwrap();
    assert_eq!(contents.matches("id,name,type").count(), 1);
    assert!(contents.starts_with(&format!("{header}1,A,")));
    assert_eq!(ids(&output), ["1", "2", "3"]);
    assert_eq!(summary.last_index, 2);
}

#[test]
fn always_failing_job_is_abandoned_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(
        ScriptedApi::default()
            .reply("1", game("1"))
            .reply("2", status(500))
            .reply("3", game("3")),
    );

    let cfg = config(dir.path(), 2);
    let output = cfg.output.clone();
    let summary = run(cfg.clone(), &api, &abc());

    assert_eq!(calls(&api, "2"), 3);
    assert_eq!(summary.abandoned, 1);
    assert_eq!(summary.written, 2);
    assert_eq!(summary.last_index, 2);
    assert_eq!(ids(&output), ["1", "3"]);

    // Abandoned jobs sit behind the checkpoint and are not retried.
    let summary = run(cfg, &api, &abc());
    assert_eq!(summary.submitted, 0);
    assert_eq!(calls(&api, "2"), 3);
}

#[test]
fn sustained_rate_limit_counts_toward_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(ScriptedApi::default().reply("1", status(429)));

    let mut cfg = config(dir.path(), 1);
    cfg.delays.max_rate_limit_retries = 2;
    let summary = run(cfg, &api, &jobs(&[("1", "A")]));

    // three attempts of (one request + two cooldown retries)
    assert_eq!(calls(&api, "1"), 9);
    assert_eq!(summary.abandoned, 1);
}

#[test]
fn empty_item_is_not_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(
        ScriptedApi::default()
            .reply("1", game("1"))
            .reply("2", no_item())
            .reply("3", game("3")),
    );

    let cfg = config(dir.path(), 1);
    let output = cfg.output.clone();
    let summary = run(cfg, &api, &abc());

    assert_eq!(calls(&api, "2"), 1);
    assert_eq!(summary.empty, 1);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(summary.processed(), 3);
    assert_eq!(ids(&output), ["1", "3"]);
    assert_eq!(summary.last_index, 2);
}

#[test]
fn rows_past_checkpoint_are_not_duplicated() {
    // A crash between checkpoint flushes: job 2 (id 3) is on disk but the
    // checkpoint only covers job 0.
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 2);
    {
        let api = Arc::new(ScriptedApi::default().reply("1", game("1")).reply("3", game("3")));
        let mut first = cfg.clone();
        first.checkpoint_every = 1_000;
        run(first, &api, &jobs(&[("1", "A"), ("3", "C")]));
    }
    fs::write(&cfg.checkpoint, r#"{"last_index": 0}"#).unwrap();

    let api = Arc::new(ScriptedApi::default().reply("2", game("2")).reply("3", game("3")));
    let output = cfg.output.clone();
    let summary = run(cfg.clone(), &api, &abc());

    assert_eq!(calls(&api, "3"), 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.submitted, 1);
    assert_eq!(ids(&output), ["1", "2", "3"]);

    // and a second identical run adds nothing
    let summary = run(cfg, &api, &abc());
    assert_eq!(summary.submitted, 0);
    assert_eq!(ids(&output), ["1", "2", "3"]);
}

#[test]
fn checkpoint_never_passes_an_unfinished_job() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), 2);
    cfg.checkpoint_every = 1;
    let output = cfg.output.clone();
    let checkpoint_path = cfg.checkpoint.clone();
    let saw_checkpoint = Arc::new(AtomicBool::new(false));
    let flag = saw_checkpoint.clone();

    // Job for id 1 stalls until id 2 has been written.
    let api = Arc::new(
        ScriptedApi::default()
            .reply("1", game("1"))
            .reply("2", game("2"))
            .on_call(move |id| {
                if id != "1" {
                    return;
                }
                let deadline = Instant::now() + Duration::from_secs(5);
                while Instant::now() < deadline {
                    if fs::read_to_string(&output).map(|s| s.contains("\n2,B,")).unwrap_or(false) {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                std::thread::sleep(Duration::from_millis(50));
                flag.store(checkpoint_path.exists(), Ordering::SeqCst);
            }),
    );

    let summary = run(cfg, &api, &jobs(&[("1", "A"), ("2", "B")]));

    assert!(!saw_checkpoint.load(Ordering::SeqCst));
    assert_eq!(summary.last_index, 1);
}

#[test]
fn checkpoint_is_saved_every_n_completions() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), 1);
    cfg.checkpoint_every = 3;
    let checkpoint_path = cfg.checkpoint.clone();
    let seen: Arc<Mutex<Vec<(String, Option<String>)>>> = Arc::default();
    let log = seen.clone();

    let game_ids = ["1", "2", "3", "4", "5"];
    let api = game_ids
        .iter()
        .fold(ScriptedApi::default(), |api, id| api.reply(id, game(id)))
        .on_call(move |id| {
            if id == "4" {
                // The writer saves the third completion while the worker moves on.
                let deadline = Instant::now() + Duration::from_secs(5);
                while !checkpoint_path.exists() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(10));
                }
            } else {
                // Long enough for an eager save of the previous job to land.
                std::thread::sleep(Duration::from_millis(50));
            }
            let state = fs::read_to_string(&checkpoint_path).ok();
            log.lock().unwrap().push((id.to_string(), state));
        });
    let api = Arc::new(api);

    let master = jobs(&[("1", "A"), ("2", "B"), ("3", "C"), ("4", "D"), ("5", "E")]);
    let summary = run(cfg, &api, &master);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 5);
    for (id, state) in &seen[..3] {
        assert_eq!(state, &None, "checkpoint written before game {id} was fetched");
    }
    assert_eq!(seen[3].0, "4");
    assert_eq!(seen[3].1.as_deref(), Some(r#"{"last_index":2}"#));
    assert_eq!(seen[4].1.as_deref(), Some(r#"{"last_index":2}"#));

    assert_eq!(summary.last_index, 4);
    assert_eq!(checkpoint(dir.path()).as_deref(), Some(r#"{"last_index":4}"#));
}

#[test]
fn interrupt_before_backoff_returns_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), 1);
    cfg.delays.initial_backoff = Duration::from_secs(30);

    let handle: Arc<Mutex<Option<Arc<AtomicBool>>>> = Arc::new(Mutex::new(None));
    let hook_handle = handle.clone();
    let api = Arc::new(
        ScriptedApi::default()
            .reply("1", game("1"))
            .reply("2", status(503))
            .on_call(move |id| {
                if id == "2" {
                    if let Some(flag) = hook_handle.lock().unwrap().as_ref() {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
            }),
    );

    let dispatcher = Dispatcher::new(cfg.clone(), Box::new(Shared(api.clone()))).unwrap();
    *handle.lock().unwrap() = Some(dispatcher.shutdown_handle());
    let started = Instant::now();
    let summary = dispatcher.run(&jobs(&[("1", "A"), ("2", "B")])).unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(summary.interrupted);
    assert_eq!(calls(&api, "2"), 1);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(summary.last_index, 0);
}

#[test]
fn interrupt_flushes_checkpoint_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), 1);
    cfg.checkpoint_every = 1_000;

    let handle: Arc<Mutex<Option<Arc<AtomicBool>>>> = Arc::new(Mutex::new(None));
    let hook_handle = handle.clone();
    let api = Arc::new(
        ScriptedApi::default()
            .reply("1", game("1"))
            .reply("2", game("2"))
            .reply("3", game("3"))
            .on_call(move |id| {
                if id == "1" {
                    if let Some(flag) = hook_handle.lock().unwrap().as_ref() {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
            }),
    );

    let dispatcher = Dispatcher::new(cfg.clone(), Box::new(Shared(api.clone()))).unwrap();
    *handle.lock().unwrap() = Some(dispatcher.shutdown_handle());
    let summary = dispatcher.run(&abc()).unwrap();

    // the in-flight request finished and was kept
    assert!(summary.interrupted);
    assert_eq!(summary.written, 1);
    assert_eq!(summary.pending, 2);
    assert_eq!(checkpoint(dir.path()).as_deref(), Some(r#"{"last_index":0}"#));

    let summary = run(cfg.clone(), &api, &abc());
    assert_eq!(summary.submitted, 2);
    assert_eq!(ids(&cfg.output), ["1", "2", "3"]);
    assert_eq!(calls(&api, "1"), 1);
}

#[test]
fn interrupt_between_attempts_leaves_job_for_resume() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 1);

    let handle: Arc<Mutex<Option<Arc<AtomicBool>>>> = Arc::new(Mutex::new(None));
    let hook_handle = handle.clone();
    let api = Arc::new(
        ScriptedApi::default()
            .reply("1", game("1"))
            .script("2", vec![status(502)])
            .reply("2", game("2"))
            .reply("3", game("3"))
            .on_call(move |id| {
                if id == "2" {
                    if let Some(flag) = hook_handle.lock().unwrap().as_ref() {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
            }),
    );

    let dispatcher = Dispatcher::new(cfg.clone(), Box::new(Shared(api.clone()))).unwrap();
    *handle.lock().unwrap() = Some(dispatcher.shutdown_handle());
    let summary = dispatcher.run(&abc()).unwrap();

    assert_eq!(calls(&api, "2"), 1);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(summary.last_index, 0);
    assert_eq!(ids(&cfg.output), ["1"]);
}

#[test]
fn description_mode_writes_single_field() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = PipelineConfig::for_mode(Mode::Descriptions);
    cfg.output = dir.path().join("game_descriptions.csv");
    cfg.checkpoint = dir.path().join("checkpoint.json");
    cfg.delays = DelayPolicy::immediate();

    let body = r#"<items><item type="boardgame" id="1"><description>Line one&amp;#10;Line two</description></item></items>"#;
    let api = Arc::new(ScriptedApi::default().reply(
        "1",
        Ok(RawResponse { status: 200, body: body.as_bytes().to_vec() }),
    ));
    let output = cfg.output.clone();
    let summary = run(cfg, &api, &jobs(&[("1", "A")]));

    assert_eq!(summary.written, 1);
    assert_eq!(
        rows(&output),
        vec![
            vec!["id".to_string(), "name".into(), "description".into()],
            vec!["1".to_string(), "A".into(), "Line one Line two".into()],
        ]
    );
    assert_eq!(checkpoint(dir.path()).as_deref(), Some(r#"{"last_index":0}"#));
}
