/// What a free-text prompt is collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Path or URL to install from.
    Install,
    /// Local plugin directory.
    LocalDir,
    /// Destination directory for a copy of the selected entry.
    ExportDir,
    /// Password or key passphrase for the pending connect. Input is masked.
    Secret,
}

impl PromptKind {
    pub fn title(self) -> &'static str {
        match self {
            PromptKind::Install => " Install from path or URL ",
            PromptKind::LocalDir => " Local plugin directory ",
            PromptKind::ExportDir => " Save a copy to directory ",
            PromptKind::Secret => " Password ",
        }
    }

    pub fn is_masked(self) -> bool {
        matches!(self, PromptKind::Secret)
    }
}

/// Application interaction modes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Mode {
    /// Navigation and single-key actions.
    #[default]
    Normal,
    /// Command palette (`:` prefix).
    Command,
    /// Fuzzy filter over the listing (`/` prefix).
    Filter,
    Prompt(PromptKind),
    /// Waiting for `y`/`n` before uninstalling the named entry.
    ConfirmUninstall(String),
}

impl Mode {
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Normal => "NORMAL",
            Mode::Command => "COMMAND",
            Mode::Filter => "FILTER",
            Mode::Prompt(_) => "PROMPT",
            Mode::ConfirmUninstall(_) => "CONFIRM",
        }
    }
}
