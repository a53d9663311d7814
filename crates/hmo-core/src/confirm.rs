use std::sync::Mutex;

use dialoguer::console::Term;
use dialoguer::Select;
use log::info;

/// How mutating actions are authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmPolicy {
    /// Ask before each action.
    AlwaysAsk,
    /// `--yes`: apply without asking.
    PreConfirmed,
    /// `--no`: report what would happen, change nothing.
    DryRun,
}

impl ConfirmPolicy {
    pub fn from_flags(yes: bool, no: bool) -> Self {
        if no {
            Self::DryRun
        } else if yes {
            Self::PreConfirmed
        } else {
            Self::AlwaysAsk
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
    /// Yes, and stop asking for the rest of the run.
    All,
}

/// Source of interactive answers.
pub trait Prompt: Send {
    fn ask(&mut self, message: &str) -> anyhow::Result<Answer>;
}

/// Arrow-key selection on stderr.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn ask(&mut self, message: &str) -> anyhow::Result<Answer> {
        let choice = Select::new()
            .with_prompt(message)
            .items(&["yes", "no", "all"])
            .default(0)
            .interact_on(&Term::stderr())?;
        Ok(match choice {
            0 => Answer::Yes,
            2 => Answer::All,
            _ => Answer::No,
        })
    }
}

/// Replays a fixed list of answers, then answers `No`.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: std::collections::VecDeque<Answer>,
    pub asked: Vec<String>,
}

impl ScriptedPrompt {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            asked: Vec::new(),
        }
    }
}

impl Prompt for ScriptedPrompt {
    fn ask(&mut self, message: &str) -> anyhow::Result<Answer> {
        self.asked.push(message.to_string());
        Ok(self.answers.pop_front().unwrap_or(Answer::No))
    }
}

/// Outcome of asking for a single action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Apply,
    Skip,
    DryRun,
}

impl Decision {
    pub fn apply(self) -> bool {
        self == Decision::Apply
    }
}

/// Gatekeeper for every mutating action of a run.
///
/// Shared by all workers; prompts are serialized so only one question is on
/// screen at a time.
pub struct Confirmer {
    policy: Mutex<ConfirmPolicy>,
    prompt: Mutex<Box<dyn Prompt>>,
}

impl Confirmer {
    pub fn new(policy: ConfirmPolicy, prompt: Box<dyn Prompt>) -> Self {
        Self {
            policy: Mutex::new(policy),
            prompt: Mutex::new(prompt),
        }
    }

    /// Confirmer that never prompts, for `--yes`/`--no` runs and tests.
    pub fn with_policy(policy: ConfirmPolicy) -> Self {
        Self::new(policy, Box::new(ScriptedPrompt::default()))
    }

    pub fn policy(&self) -> ConfirmPolicy {
        *self.policy.lock().unwrap()
    }

    /// Ask whether to perform the action described by `message`.
    ///
    /// Under dry-run the action is logged as `[dry run] <message>` and the
    /// caller must not perform it.
    pub fn decide(&self, message: &str) -> anyhow::Result<Decision> {
        match self.policy() {
            ConfirmPolicy::PreConfirmed => return Ok(Decision::Apply),
            ConfirmPolicy::DryRun => {
                info!("[dry run] {}", message);
                return Ok(Decision::DryRun);
            }
            ConfirmPolicy::AlwaysAsk => {}
        }

        let mut prompt = self.prompt.lock().unwrap();
        // another worker may have answered "all" while we waited
        if self.policy() == ConfirmPolicy::PreConfirmed {
            return Ok(Decision::Apply);
        }
        match prompt.ask(message)? {
            Answer::Yes => Ok(Decision::Apply),
            Answer::No => Ok(Decision::Skip),
            Answer::All => {
                *self.policy.lock().unwrap() = ConfirmPolicy::PreConfirmed;
                Ok(Decision::Apply)
            }
        }
    }
}

impl std::fmt::Debug for Confirmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Confirmer")
            .field("policy", &self.policy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_flags() {
        assert_eq!(ConfirmPolicy::from_flags(false, false), ConfirmPolicy::AlwaysAsk);
        assert_eq!(ConfirmPolicy::from_flags(true, false), ConfirmPolicy::PreConfirmed);
        assert_eq!(ConfirmPolicy::from_flags(false, true), ConfirmPolicy::DryRun);
        // --no wins
        assert_eq!(ConfirmPolicy::from_flags(true, true), ConfirmPolicy::DryRun);
    }

    #[test]
    fn test_preconfirmed_and_dry_run_never_prompt() {
        let yes = Confirmer::with_policy(ConfirmPolicy::PreConfirmed);
        assert_eq!(yes.decide("rename a to b").unwrap(), Decision::Apply);
        let no = Confirmer::with_policy(ConfirmPolicy::DryRun);
        assert_eq!(no.decide("rename a to b").unwrap(), Decision::DryRun);
        assert!(!no.decide("rename a to b").unwrap().apply());
    }

    #[test]
    fn test_yes_no_answers() {
        let c = Confirmer::new(
            ConfirmPolicy::AlwaysAsk,
            Box::new(ScriptedPrompt::new([Answer::Yes, Answer::No])),
        );
        assert_eq!(c.decide("first").unwrap(), Decision::Apply);
        assert_eq!(c.decide("second").unwrap(), Decision::Skip);
        assert_eq!(c.policy(), ConfirmPolicy::AlwaysAsk);
    }

    #[test]
    fn test_all_stops_asking() {
        let c = Confirmer::new(
            ConfirmPolicy::AlwaysAsk,
            Box::new(ScriptedPrompt::new([Answer::All])),
        );
        assert_eq!(c.decide("first").unwrap(), Decision::Apply);
        assert_eq!(c.policy(), ConfirmPolicy::PreConfirmed);
        // script is exhausted; a further prompt would answer No
        assert_eq!(c.decide("second").unwrap(), Decision::Apply);
        assert_eq!(c.decide("third").unwrap(), Decision::Apply);
    }
}
