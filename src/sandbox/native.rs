use super::backend::ExecEnv;
use super::process::SpawnRequest;

/// Direct spawn used by `None` and `App` modes: no containment beyond the
/// working directory, environment and cancellation context.
pub fn direct_command(env: &ExecEnv, name: &str, args: &[String]) -> SpawnRequest {
    SpawnRequest::new(name, name, env.work_dir.clone())
        .args(args.iter().cloned())
        .env(env.env.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_direct_command_uses_work_dir_and_env() {
        let env = ExecEnv {
            work_dir: PathBuf::from("/project"),
            tmp_dir: PathBuf::from("/tmp"),
            writable_dirs: vec![PathBuf::from("/tmp")],
            env: vec![("PATH".into(), "/usr/bin".into())],
            state_dir_name: ".agent-sandbox".into(),
        };
        let req = direct_command(&env, "ls", &["-la".to_string()]);
        assert_eq!(req.program, "ls");
        assert_eq!(req.args, vec!["-la"]);
        assert_eq!(req.work_dir, PathBuf::from("/project"));
        assert_eq!(req.env, env.env);
    }
}
