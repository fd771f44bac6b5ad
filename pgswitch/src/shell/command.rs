//! Shell command parsing.

use std::str::FromStr;

use crate::switchover::MessageKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Enable,
    Sync,
    Pause,
    Resume,
    Execute,
    Abort,
    Reset,
    Help,
    Exit,
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Command::*;
        match s.trim().to_lowercase().as_str() {
            "status" | "s" => Ok(Status),
            "enable" => Ok(Enable),
            "sync" => Ok(Sync),
            "pause" => Ok(Pause),
            "resume" => Ok(Resume),
            "execute" => Ok(Execute),
            "abort" => Ok(Abort),
            "reset" => Ok(Reset),
            "help" | "?" => Ok(Help),
            "exit" | "quit" | "q" => Ok(Exit),
            _ => Err(()),
        }
    }
}

impl Command {
    /// The bus message this command turns into, if any. The shell
    /// holds no authority; the leader does the work.
    pub fn message_kind(&self) -> Option<MessageKind> {
        use Command::*;
        match self {
            Enable => Some(MessageKind::Enable),
            Sync => Some(MessageKind::SyncCheck),
            Pause => Some(MessageKind::Pause),
            Resume => Some(MessageKind::Resume),
            Execute => Some(MessageKind::Execute),
            Abort => Some(MessageKind::Abort),
            Reset => Some(MessageKind::Reset),
            Status | Help | Exit => None,
        }
    }
}

pub const HELP: &str = "\
commands:
  status   show cluster phase, nodes and replication lag
  enable   begin switchover: install capture, start sync
  sync     force a sync progress re-check
  pause    pause bulk copy (tail keeps running)
  resume   resume bulk copy
  execute  freeze the fleet and flip to the next database
  abort    abort the switchover, stay on the old database
  reset    clean up a finished or aborted switchover
  exit     leave the shell (the cluster keeps its state)";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("status".parse::<Command>().unwrap(), Command::Status);
        assert_eq!("  EXECUTE ".parse::<Command>().unwrap(), Command::Execute);
        assert_eq!("q".parse::<Command>().unwrap(), Command::Exit);
        assert!("self-destruct".parse::<Command>().is_err());
    }

    #[test]
    fn test_local_commands_have_no_message() {
        assert!(Command::Status.message_kind().is_none());
        assert!(Command::Help.message_kind().is_none());
        assert_eq!(
            Command::Execute.message_kind(),
            Some(MessageKind::Execute)
        );
    }
}
