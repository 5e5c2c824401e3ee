use std::path::PathBuf;

/// Returns the user's home directory, honouring `TESTFLOW_HOME` first.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("TESTFLOW_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME")
                .or_else(|| std::env::var_os("USERPROFILE"))
                .map(PathBuf::from)
        })
}

/// Returns the directory holding run history and invocation logs.
pub fn data_dir() -> PathBuf {
    if let Some(mut dir) = home_dir() {
        dir.push(".testflow");
        dir
    } else {
        PathBuf::from(".testflow")
    }
}

pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}
