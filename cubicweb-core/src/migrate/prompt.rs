// Confirmation points of a migration run.

use std::collections::VecDeque;
use std::io::{BufRead, ErrorKind, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Result, StoreError};

const INTERRUPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
    /// Roll back and stop the whole run.
    Abort,
}

impl Answer {
    fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "y" | "yes" => Some(Self::Yes),
            "n" | "no" => Some(Self::No),
            "a" | "abort" => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Asks the operator a question. Only consulted by interactive runs.
pub trait Prompter: Send + Sync {
    fn ask(&self, question: &str, default: Answer) -> Result<Answer>;
}

/// Reads answers from standard input. End of input counts as abort, and so
/// does an interrupt raised through the shared flag while waiting.
#[derive(Debug, Default)]
pub struct StdinPrompter {
    interrupted: Arc<AtomicBool>,
}

impl StdinPrompter {
    pub fn new(interrupted: Arc<AtomicBool>) -> Self {
        Self { interrupted }
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Waits for one line, polling the interrupt flag. `None` means the
    /// wait was cut short.
    fn read_line(&self) -> Result<Option<String>> {
        let (tx, rx) = mpsc::channel();
        // The reader stays blocked on stdin after an interrupt; the process
        // exits right after the rollback.
        std::thread::spawn(move || {
            let mut line = String::new();
            let read = std::io::stdin().lock().read_line(&mut line);
            let _ = tx.send(read.map(|n| (n, line)));
        });
        loop {
            if self.is_interrupted() {
                return Ok(None);
            }
            match rx.recv_timeout(INTERRUPT_POLL) {
                Ok(Ok((0, _))) => return Ok(None),
                Ok(Ok((_, line))) => return Ok(Some(line)),
                Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => return Ok(None),
                Ok(Err(e)) => return Err(StoreError::Io(e).into()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }
}

impl Prompter for StdinPrompter {
    fn ask(&self, question: &str, default: Answer) -> Result<Answer> {
        let hint = match default {
            Answer::Yes => "[Y/n/a]",
            Answer::No => "[y/N/a]",
            Answer::Abort => "[y/n/A]",
        };
        let mut stderr = std::io::stderr();
        loop {
            if self.is_interrupted() {
                return Ok(Answer::Abort);
            }
            write!(stderr, "{question} {hint} ").map_err(StoreError::Io)?;
            stderr.flush().map_err(StoreError::Io)?;
            let Some(line) = self.read_line()? else {
                let _ = writeln!(stderr);
                return Ok(Answer::Abort);
            };
            if line.trim().is_empty() {
                return Ok(default);
            }
            if let Some(answer) = Answer::parse(&line) {
                return Ok(answer);
            }
        }
    }
}

/// Answers every question with the same answer.
#[derive(Debug)]
pub struct AutoPrompter(pub Answer);

impl Prompter for AutoPrompter {
    fn ask(&self, _question: &str, _default: Answer) -> Result<Answer> {
        Ok(self.0)
    }
}

/// Replays a fixed list of answers, then aborts. Records the questions.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<Answer>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl Prompter for ScriptedPrompter {
    fn ask(&self, question: &str, _default: Answer) -> Result<Answer> {
        self.asked
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .push(question.to_string());
        Ok(self
            .answers
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .pop_front()
            .unwrap_or(Answer::Abort))
    }
}
