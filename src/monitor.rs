//! Command-line kernel monitor for inspecting page mappings.
//!
//! A thin, interactive debugger layered on the raw walk interface of the
//! [`Machine`]. It displays and edits page table entries and dumps memory;
//! it holds no protocol state of its own and knows nothing about the
//! copy-on-write bookkeeping. Output goes to any [`core::fmt::Write`]
//! sink, which keeps the tool usable from a serial console and testable
//! from a host.

use core::fmt::{self, Write};

use crate::{
    addressing::{PAGE_MASK, PAGE_SIZE, Va},
    env::EnvId,
    machine::Machine,
    page_table::PteFlags,
};

struct Command {
    name: &'static str,
    desc: &'static str,
    func: fn(&mut Monitor<'_>, &[&str], &mut dyn Write) -> fmt::Result,
}

// The methods are defined on `Monitor<'m>`, so their fn items carry the
// early-bound lifetime and do not coerce to the higher-ranked pointer
// type of `func`. The closures do.
static COMMANDS: &[Command] = &[
    Command {
        name: "help",
        desc: "Display this list of commands",
        func: |m, argv, out| m.cmd_help(argv, out),
    },
    Command {
        name: "showmappings",
        desc: "Display physical page mappings",
        func: |m, argv, out| m.cmd_showmappings(argv, out),
    },
    Command {
        name: "setmappings",
        desc: "Set permissions for a given address range",
        func: |m, argv, out| m.cmd_setmappings(argv, out),
    },
    Command {
        name: "dump",
        desc: "Dump contents of a virtual address range",
        func: |m, argv, out| m.cmd_dump(argv, out),
    },
];

const MAXARGS: usize = 16;

/// The monitor, bound to one environment's address space.
pub struct Monitor<'m> {
    machine: &'m mut Machine,
    env: EnvId,
}

impl<'m> Monitor<'m> {
    /// Build a monitor inspecting `env` on `machine`.
    pub fn new(machine: &'m mut Machine, env: EnvId) -> Self {
        Self { machine, env }
    }

    /// Print the greeting banner.
    pub fn banner(out: &mut dyn Write) -> fmt::Result {
        writeln!(out, "Welcome to the kernel monitor!")?;
        writeln!(out, "Type 'help' for a list of commands.")
    }

    /// Parse and run one command line.
    ///
    /// Unknown commands and usage errors print a message; the monitor
    /// itself never fails on bad input.
    pub fn runcmd(&mut self, line: &str, out: &mut dyn Write) -> fmt::Result {
        let mut argv = [""; MAXARGS];
        let mut argc = 0;
        for word in line.split_whitespace() {
            if argc == MAXARGS {
                return writeln!(out, "Too many arguments (max {})", MAXARGS);
            }
            argv[argc] = word;
            argc += 1;
        }
        if argc == 0 {
            return Ok(());
        }
        for cmd in COMMANDS {
            if cmd.name == argv[0] {
                return (cmd.func)(self, &argv[..argc], out);
            }
        }
        writeln!(out, "Unknown command '{}'", argv[0])
    }

    fn cmd_help(&mut self, _argv: &[&str], out: &mut dyn Write) -> fmt::Result {
        for cmd in COMMANDS {
            writeln!(out, "{} - {}", cmd.name, cmd.desc)?;
        }
        Ok(())
    }

    fn cmd_showmappings(&mut self, argv: &[&str], out: &mut dyn Write) -> fmt::Result {
        let (start, end) = match argv {
            [_, start] => match parse_hex(start) {
                Some(start) => (start, start),
                None => return writeln!(out, "Usage: showmappings <start> [<end>]"),
            },
            [_, start, end] => match (parse_hex(start), parse_hex(end)) {
                (Some(start), Some(end)) if start <= end => (start, end),
                _ => {
                    return writeln!(out, "Usage: showmappings <start> <end>   (start <= end)");
                }
            },
            _ => {
                return writeln!(out, "Need a range of virtual addresses or a single one");
            }
        };
        let mut addr = start;
        loop {
            self.show_one(addr, out)?;
            match addr.checked_add(PAGE_SIZE) {
                Some(next) if next <= end => addr = next,
                _ => break,
            }
        }
        Ok(())
    }

    fn cmd_setmappings(&mut self, argv: &[&str], out: &mut dyn Write) -> fmt::Result {
        let (start, end, perm) = match argv {
            [_, start, end, perm] => {
                match (parse_hex(start), parse_hex(end), parse_hex(perm)) {
                    (Some(start), Some(end), Some(perm)) if start <= end => (start, end, perm),
                    _ => return setmappings_usage(out),
                }
            }
            _ => return setmappings_usage(out),
        };
        let flags = PteFlags::from_bits_truncate(perm & PAGE_MASK);
        let mut addr = start & !PAGE_MASK;
        loop {
            if let Some(va) = Va::new(addr) {
                if self
                    .machine
                    .set_mapping_flags(self.env, va.page_number(), flags)
                    .is_ok()
                {
                    self.show_one(addr, out)?;
                }
            }
            match addr.checked_add(PAGE_SIZE) {
                Some(next) if next <= end => addr = next,
                _ => break,
            }
        }
        Ok(())
    }

    fn cmd_dump(&mut self, argv: &[&str], out: &mut dyn Write) -> fmt::Result {
        const WORD: usize = core::mem::size_of::<usize>();
        let (start, count) = match argv {
            [_, start, count] => match (parse_hex(start), parse_hex(count)) {
                (Some(start), Some(count)) => (start, count),
                _ => return writeln!(out, "Usage: dump <addr> <no. of words>"),
            },
            _ => return writeln!(out, "Usage: dump <addr> <no. of words>"),
        };
        let end = start.saturating_add(count.saturating_mul(WORD));
        writeln!(out, "start {:#x} end {:#x}", start, end)?;
        let mut addr = start;
        while addr < end {
            // On the last page of the address space the page boundary
            // would overflow; `end` cannot exceed it, so clamp there.
            let next_page = (addr | PAGE_MASK).checked_add(1).unwrap_or(end);
            let pte = Va::new(addr)
                .and_then(|va| self.machine.mapping(self.env, va.page_number()));
            let Some(frame) = pte.and_then(|pte| pte.frame()) else {
                writeln!(out, "va: {:#x} - {:#x} not mapped", addr, next_page)?;
                addr = next_page;
                continue;
            };
            let Some(data) = self.machine.frame_contents(frame) else {
                writeln!(out, "va: {:#x} - {:#x} not mapped", addr, next_page)?;
                addr = next_page;
                continue;
            };
            let stop = end.min(next_page);
            while addr + WORD <= stop {
                let off = addr & PAGE_MASK;
                let mut word = [0u8; WORD];
                word.copy_from_slice(&data[off..off + WORD]);
                writeln!(
                    out,
                    "Value at {:#x} is {:#018x}",
                    addr,
                    usize::from_le_bytes(word)
                )?;
                addr += WORD;
            }
            addr = stop;
        }
        Ok(())
    }

    fn show_one(&self, addr: usize, out: &mut dyn Write) -> fmt::Result {
        let pte = Va::new(addr)
            .and_then(|va| self.machine.mapping(self.env, va.page_number()));
        let Some(pte) = pte else {
            return writeln!(out, "va: {:#010x}  Not Mapped", addr);
        };
        let Some(frame) = pte.frame() else {
            return writeln!(out, "va: {:#010x}  Not Mapped", addr);
        };
        let flags = pte.flags();
        let offset_mask = if flags.contains(PteFlags::PS) {
            0x3f_ffff
        } else {
            PAGE_MASK
        };
        writeln!(
            out,
            "va:{:#010x} frame:{:#x} offset:{:#x} User:{} Writable:{} Dirty:{} PS:{}",
            addr,
            frame.into_usize(),
            addr & offset_mask,
            flags.contains(PteFlags::US) as u8,
            flags.contains(PteFlags::RW) as u8,
            flags.contains(PteFlags::D) as u8,
            flags.contains(PteFlags::PS) as u8,
        )
    }
}

fn setmappings_usage(out: &mut dyn Write) -> fmt::Result {
    writeln!(
        out,
        "Usage: setmappings <start> <end> <permissions> (start <= end)"
    )?;
    writeln!(
        out,
        "permissions will be applied to all pages within the range [start, end]"
    )
}

fn parse_hex(s: &str) -> Option<usize> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    usize::from_str_radix(s, 16).ok()
}
