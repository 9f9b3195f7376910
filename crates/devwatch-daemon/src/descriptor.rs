//! What to launch, and the rules for choosing it

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Argument that makes the daemon report its synthetic test device
pub const SHOW_TEST_DEVICE_FLAG: &str = "--show-test-device";

/// Complete launch configuration of one tool instance.
///
/// Equality is structural over every field. Two equal descriptors never
/// trigger a restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ToolDescriptor {
    pub working_dir: PathBuf,
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Extra environment on top of the inherited one
    pub env: BTreeMap<String, String>,
}

impl ToolDescriptor {
    pub fn new(working_dir: impl Into<PathBuf>, executable: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            executable: executable.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        write!(f, " (in {})", self.working_dir.display())
    }
}

/// Environment collaborators' view of the world, as far as launching goes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorInputs {
    /// SDK home; `bin/flutter` is launched from here
    pub sdk_path: Option<PathBuf>,
    /// Whether the watched workspace contains a Flutter project
    pub has_flutter_project: bool,
    pub show_test_device: bool,
    /// Build-workspace root, used when no SDK is configured
    pub workspace_root: Option<PathBuf>,
    /// Daemon script provided by the build workspace, relative to its root
    pub daemon_script: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// True if `dir` holds a Flutter project
pub fn has_flutter_project(dir: &Path) -> bool {
    dir.join("pubspec.yaml").is_file()
}

/// Path of the `flutter` launcher inside an SDK
pub fn sdk_tool_path(sdk: &Path) -> PathBuf {
    let name = if cfg!(windows) { "flutter.bat" } else { "flutter" };
    sdk.join("bin").join(name)
}

/// Decide what should be running.
///
/// Returns `None` when device watching is unconfigured and any running
/// instance should be shut down.
///
/// - With an SDK: requires a Flutter project, then runs `<sdk>/bin/flutter daemon`
///   in the SDK home.
/// - Without one: runs the build workspace's daemon script, with no arguments,
///   in the workspace root.
pub fn choose_descriptor(inputs: &DescriptorInputs) -> Option<ToolDescriptor> {
    if let Some(sdk) = &inputs.sdk_path {
        if !inputs.has_flutter_project {
            return None;
        }
        let mut args = Vec::new();
        if inputs.show_test_device {
            args.push(SHOW_TEST_DEVICE_FLAG.to_string());
        }
        args.push("daemon".to_string());
        return Some(ToolDescriptor {
            working_dir: sdk.clone(),
            executable: sdk_tool_path(sdk),
            args,
            env: inputs.env.clone(),
        });
    }

    let root = inputs.workspace_root.as_ref()?;
    let script = inputs.daemon_script.as_ref()?;
    let executable = if script.is_absolute() {
        script.clone()
    } else {
        root.join(script)
    };
    Some(ToolDescriptor {
        working_dir: root.clone(),
        executable,
        args: Vec::new(),
        env: inputs.env.clone(),
    })
}
