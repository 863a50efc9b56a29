//! `/proc/<pid>/maps` parsing.
//!
//! Each line is `start-end perm offset dev inode [path]`. Non-readable
//! mappings are skipped; everything else becomes a [`Dso`].

use crate::dso::{Dso, DsoKind};
use crate::file_info::FileInfoId;

fn get_until<'a>(p: &mut &'a str, delimiter: char) -> &'a str {
    match p.find(delimiter) {
        Some(index) => {
            let (before, after) = p.split_at(index);
            *p = &after[delimiter.len_utf8()..];
            before
        }
        None => {
            let before = *p;
            *p = "";
            before
        }
    }
}

fn get_char(p: &mut &str) -> Option<char> {
    let ch = p.chars().next()?;
    *p = &p[ch.len_utf8()..];
    Some(ch)
}

fn skip_whitespace(p: &mut &str) {
    *p = p.trim_start_matches(' ');
}

pub fn parse_line(pid: i32, mut line: &str) -> Option<Dso> {
    let start = u64::from_str_radix(get_until(&mut line, '-'), 16).ok()?;
    let end = u64::from_str_radix(get_until(&mut line, ' '), 16).ok()?;
    let is_read = get_char(&mut line)? == 'r';
    let _is_write = get_char(&mut line)?;
    let is_executable = get_char(&mut line)? == 'x';
    let _is_shared = get_char(&mut line)?;
    get_char(&mut line)?;

    let page_offset = u64::from_str_radix(get_until(&mut line, ' '), 16).ok()?;
    let _major = u32::from_str_radix(get_until(&mut line, ':'), 16).ok()?;
    let _minor = u32::from_str_radix(get_until(&mut line, ' '), 16).ok()?;
    let inode: u64 = get_until(&mut line, ' ').parse().ok()?;
    skip_whitespace(&mut line);
    let path = line.to_owned();

    if !is_read {
        return None;
    }

    let kind = DsoKind::from_path(&path);
    Some(Dso {
        pid,
        start,
        end,
        page_offset,
        inode,
        path,
        kind,
        executable: is_executable,
        file_info_id: FileInfoId::UNSET,
    })
}

pub fn parse(pid: i32, maps: &str) -> Vec<Dso> {
    maps.trim()
        .split('\n')
        .filter_map(|line| parse_line(pid, line))
        .collect()
}
