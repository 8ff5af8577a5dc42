//! `distill eval`

use super::{input_failure, JobArgs};
use distill_training::{run_eval_job, JobEnv, JsonlSink};

pub fn execute(args: &JobArgs) -> i32 {
    let sink = JsonlSink::stdout();
    let raw = match args.load() {
        Ok(raw) => raw,
        Err(err) => return input_failure(&err, &sink),
    };
    let mut env = JobEnv::default();
    run_eval_job(&raw, args.run_dir.as_deref(), &mut env, &sink)
}
