//! implements a parser for the job control protocol.
use std::fmt;

use crate::types::protocol::JobCommand;
use crate::types::serialisable::WireSerialisable;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownCommand,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownCommand => "unknown command",
        })
    }
}

impl WireSerialisable for ParsingError {
    fn serialise_wire(&self) -> Vec<u8> {
        match self {
            ParsingError::BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            ParsingError::UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
        }
    }
}

/// A minimal, zero-copy tokenizer over a single request line.
struct ParseState<'a> {
    from: &'a [u8],
}

impl ParseState<'_> {
    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.from.is_empty() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&[u8], ParsingError> {
        match self.next_token() {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes a space then an unsigned decimal that fits in `N`.
    fn expect_next_number<N: TryFrom<u64>>(
        &mut self,
    ) -> Result<N, ParsingError> {
        self.expect_space()?;

        let mut r = 0u64;
        for v in self.expect_next_token()? {
            let digit = match v {
                b'0'..=b'9' => u64::from(*v - b'0'),
                _ => return Err(ParsingError::BadFormat),
            };
            r = r
                .checked_mul(10)
                .and_then(|r| r.checked_add(digit))
                .ok_or(ParsingError::BadFormat)?;
        }

        N::try_from(r).map_err(|_| ParsingError::BadFormat)
    }

    /// As `expect_next_number`, but yields None at the end of the input.
    fn next_optional_number<N: TryFrom<u64>>(
        &mut self,
    ) -> Result<Option<N>, ParsingError> {
        if self.from.is_empty() {
            return Ok(None);
        }
        self.expect_next_number().map(Some)
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.first() {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes until reaching a space byte or the end of the input. Returns
    /// None at the end of the input, and a zero-length slice on consecutive
    /// spaces.
    fn next_token(&mut self) -> Option<&[u8]> {
        if self.from.is_empty() {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| *c == b' ')
            .unwrap_or(self.from.len());

        let (token, rest) = self.from.split_at(idx);
        self.from = rest;

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

impl TryFrom<&[u8]> for JobCommand {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use JobCommand::*;

        let mut ps: ParseState = value.into();

        let cmd = match ps.expect_next_token()? {
            // <cmd>
            b"claim-next" => ClaimNext,
            b"list-ready" => ListReady,
            b"quit" => Quit,
            b"requeue-expired" => RequeueExpired,
            b"stats" => StatsServer,

            // <cmd> <delay>
            b"create" => Create {
                delay: ps.expect_next_number()?,
            },

            // <cmd> <id>
            b"claim" => Claim {
                id: ps.expect_next_number()?,
            },
            b"dependants" => Dependants {
                id: ps.expect_next_number()?,
            },
            b"destroy" => Destroy {
                id: ps.expect_next_number()?,
            },
            b"prerequisites" => Prerequisites {
                id: ps.expect_next_number()?,
            },
            b"start" => Start {
                id: ps.expect_next_number()?,
            },
            b"stats-job" => StatsJob {
                id: ps.expect_next_number()?,
            },

            // <cmd> <id> [<attempt>]
            b"complete" => Complete {
                id: ps.expect_next_number()?,
                attempt: ps.next_optional_number()?,
            },
            b"fail" => Fail {
                id: ps.expect_next_number()?,
                attempt: ps.next_optional_number()?,
            },
            b"queue" => Queue {
                id: ps.expect_next_number()?,
                attempt: ps.next_optional_number()?,
            },

            // <cmd> <id> <seconds>
            b"lease" => Lease {
                id: ps.expect_next_number()?,
                seconds: ps.expect_next_number()?,
            },

            // <cmd> <id> <seconds> [<attempt>]
            b"renew" => Renew {
                id: ps.expect_next_number()?,
                seconds: ps.expect_next_number()?,
                attempt: ps.next_optional_number()?,
            },

            // <cmd> <id> <n_bytes>
            b"log" => Log {
                id: ps.expect_next_number()?,
                n_bytes: ps.expect_next_number()?,
            },

            // <cmd> <dependant> <prerequisite>
            b"add-prerequisite" => AddPrerequisite {
                dependant: ps.expect_next_number()?,
                prerequisite: ps.expect_next_number()?,
            },
            b"remove-prerequisite" => RemovePrerequisite {
                dependant: ps.expect_next_number()?,
                prerequisite: ps.expect_next_number()?,
            },

            _ => return Err(ParsingError::UnknownCommand),
        };

        ps.expect_done_and(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        use JobCommand::*;
        use ParsingError::*;

        const U32_MAX_PLUS_1: u64 = 1 << 32;
        const U64_MAX_PLUS_1: u128 = 1 << 64;

        // Asserts the line parses into the given command successfully.
        #[track_caller]
        fn ok(line: &[u8], res: JobCommand) {
            assert_eq!(line.try_into(), Ok(res));
        }

        // Asserts the line fails to parse with a BadFormat error.
        #[track_caller]
        fn bf(line: &[u8]) {
            assert_eq!(TryInto::<JobCommand>::try_into(line), Err(BadFormat));
        }

        // Asserts the line fails to parse with an UnknownCommand error.
        #[track_caller]
        fn uc(line: &[u8]) {
            assert_eq!(
                TryInto::<JobCommand>::try_into(line),
                Err(UnknownCommand)
            );
        }

        // Check silly non-commands
        bf(b"");
        bf(b" ");
        uc(b"syntax-error");
        uc(b"CLAIM 1");

        // Check create with overflow protection.
        ok(b"create 0", Create { delay: 0 });
        ok(b"create 4294967295", Create { delay: u32::MAX });
        bf(format!("create {U32_MAX_PLUS_1}").as_bytes());
        bf(b"create");
        bf(b"create ");
        bf(b"create -1");
        bf(b"create 1 2");

        ok(b"start 12", Start { id: 12 });
        ok(
            b"complete 12",
            Complete {
                id: 12,
                attempt: None,
            },
        );
        ok(
            b"complete 12 3",
            Complete {
                id: 12,
                attempt: Some(3),
            },
        );
        bf(b"complete 12 ");
        bf(b"complete 12 3 4");
        ok(
            b"fail 12",
            Fail {
                id: 12,
                attempt: None,
            },
        );
        ok(
            b"queue 12 1",
            Queue {
                id: 12,
                attempt: Some(1),
            },
        );
        ok(b"claim 18446744073709551615", Claim { id: u64::MAX });
        bf(format!("claim {U64_MAX_PLUS_1}").as_bytes());
        bf(b"claim  1");
        bf(b"claim 1 ");
        bf(b"claim x1");

        ok(b"claim-next", ClaimNext);
        bf(b"claim-next ");

        ok(b"lease 5 60", Lease { id: 5, seconds: 60 });
        bf(b"lease 5");
        ok(
            b"renew 5 0",
            Renew {
                id: 5,
                seconds: 0,
                attempt: None,
            },
        );
        ok(
            b"renew 5 60 2",
            Renew {
                id: 5,
                seconds: 60,
                attempt: Some(2),
            },
        );
        bf(b"renew 5");
        ok(b"log 5 11", Log { id: 5, n_bytes: 11 });

        ok(
            b"add-prerequisite 2 1",
            AddPrerequisite {
                dependant: 2,
                prerequisite: 1,
            },
        );
        ok(
            b"remove-prerequisite 2 1",
            RemovePrerequisite {
                dependant: 2,
                prerequisite: 1,
            },
        );
        bf(b"add-prerequisite 2");

        ok(b"prerequisites 3", Prerequisites { id: 3 });
        ok(b"dependants 3", Dependants { id: 3 });
        ok(b"list-ready", ListReady);
        ok(b"requeue-expired", RequeueExpired);
        ok(b"destroy 3", Destroy { id: 3 });
        ok(b"stats-job 3", StatsJob { id: 3 });
        ok(b"stats", StatsServer);
        ok(b"quit", Quit);
    }
}
