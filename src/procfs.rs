// src/procfs.rs

//! /proc 读取工具
//!
//! 每个函数只做解析，读不到文件（进程已退出等）时返回错误，由调用方决定是否忽略。
//! 解析函数与读取函数分开，方便对固定文本做单元测试。
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

/// 内核 USER_HZ，绝大多数平台为 100
pub const CLOCK_TICKS_PER_SEC: i64 = 100;

pub fn ticks_to_ms(ticks: i64) -> i64 {
    ticks * 1000 / CLOCK_TICKS_PER_SEC
}

/// /proc 根目录，测试中可替换为临时目录
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        ProcFs { root: PathBuf::from("/proc") }
    }
}

/// /proc/stat 第一行汇总的 CPU 时间（单位 tick）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemCpuTimes {
    pub total: i64,
    pub busy: i64,
}

/// /proc/<pid>/task/<tid>/stat 中关心的字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStat {
    pub tid: i32,
    pub name: String,
    pub state: char,
    pub cpu_ticks: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetBytes {
    pub rx: i64,
    pub tx: i64,
}

impl ProcFs {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        ProcFs { root: root.into() }
    }

    fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    fn read(&self, rel: impl AsRef<Path>) -> Result<String> {
        let path = self.path(rel);
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
    }

    pub fn system_cpu(&self) -> Result<SystemCpuTimes> {
        parse_system_cpu(&self.read("stat")?)
    }

    pub fn cpu_cores(&self) -> Result<u32> {
        Ok(count_cores(&self.read("stat")?))
    }

    /// 进程累计 CPU tick（utime + stime + cutime + cstime）
    pub fn process_cpu_ticks(&self, pid: i32) -> Result<i64> {
        let stat = parse_task_stat(&self.read(format!("{pid}/stat"))?)?;
        Ok(stat.cpu_ticks)
    }

    pub fn threads(&self, pid: i32) -> Result<Vec<TaskStat>> {
        let dir = self.path(format!("{pid}/task"));
        let entries = fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))?;
        let mut tasks = Vec::new();
        for entry in entries.flatten() {
            let stat_path = entry.path().join("stat");
            // 线程可能在遍历过程中退出
            let Ok(text) = fs::read_to_string(&stat_path) else { continue };
            if let Ok(stat) = parse_task_stat(&text) {
                tasks.push(stat);
            }
        }
        tasks.sort_by_key(|t| t.tid);
        Ok(tasks)
    }

    pub fn net_bytes(&self, pid: i32) -> Result<NetBytes> {
        parse_net_dev(&self.read(format!("{pid}/net/dev"))?)
    }

    pub fn uid(&self, pid: i32) -> Result<u32> {
        parse_status_uid(&self.read(format!("{pid}/status"))?)
    }

    /// tcp 与 tcp6 中属于 `uid` 的连接数
    pub fn tcp_connections(&self, pid: i32, uid: u32) -> Result<u32> {
        let mut count = 0;
        let mut any = false;
        for table in ["tcp", "tcp6"] {
            if let Ok(text) = self.read(format!("{pid}/net/{table}")) {
                any = true;
                count += count_tcp_rows(&text, uid);
            }
        }
        if !any {
            return Err(anyhow!("no tcp tables for pid {pid}"));
        }
        Ok(count)
    }

    /// 取 cmdline 的第一个参数作为进程名（Android 上即 app 包名）
    pub fn cmdline(&self, pid: i32) -> Result<String> {
        let raw = fs::read(self.path(format!("{pid}/cmdline")))
            .with_context(|| format!("reading cmdline of {pid}"))?;
        let first = raw.split(|b| *b == 0).next().unwrap_or(&[]);
        Ok(String::from_utf8_lossy(first).into_owned())
    }
}

pub fn parse_system_cpu(text: &str) -> Result<SystemCpuTimes> {
    let line = text
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| anyhow!("missing aggregate cpu line"))?;
    let fields: Vec<i64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse::<i64>())
        .collect::<Result<_, _>>()
        .context("parsing cpu line")?;
    if fields.len() < 5 {
        return Err(anyhow!("short cpu line: {line}"));
    }
    let total: i64 = fields.iter().sum();
    // idle 与 iowait 不计入忙碌时间
    let busy = total - fields[3] - fields[4];
    Ok(SystemCpuTimes { total, busy })
}

pub fn count_cores(text: &str) -> u32 {
    text.lines()
        .filter(|l| l.starts_with("cpu") && l.as_bytes().get(3).is_some_and(u8::is_ascii_digit))
        .count() as u32
}

/// 解析 stat 行；进程名可能包含空格和括号，按最后一个 ')' 切分
pub fn parse_task_stat(text: &str) -> Result<TaskStat> {
    let open = text.find('(').ok_or_else(|| anyhow!("malformed stat: {text}"))?;
    let close = text.rfind(')').ok_or_else(|| anyhow!("malformed stat: {text}"))?;
    if close < open {
        return Err(anyhow!("malformed stat: {text}"));
    }
    let tid: i32 = text[..open].trim().parse().context("parsing tid")?;
    let name = text[open + 1..close].to_string();
    let rest: Vec<&str> = text[close + 1..].split_whitespace().collect();
    // rest[0] 是 state（第 3 个字段），utime 为第 14 个字段
    if rest.len() < 15 {
        return Err(anyhow!("short stat for {tid}"));
    }
    let state = rest[0].chars().next().unwrap_or('?');
    let mut cpu_ticks = 0;
    for field in &rest[11..15] {
        cpu_ticks += field.parse::<i64>().context("parsing cpu ticks")?;
    }
    Ok(TaskStat { tid, name, state, cpu_ticks })
}

/// 汇总除 lo 以外所有网卡的收发字节
pub fn parse_net_dev(text: &str) -> Result<NetBytes> {
    let mut bytes = NetBytes::default();
    for line in text.lines().skip(2) {
        let Some((iface, data)) = line.split_once(':') else { continue };
        if iface.trim() == "lo" {
            continue;
        }
        let cols: Vec<&str> = data.split_whitespace().collect();
        if cols.len() < 9 {
            return Err(anyhow!("short net/dev row: {line}"));
        }
        bytes.rx += cols[0].parse::<i64>().context("parsing rx bytes")?;
        bytes.tx += cols[8].parse::<i64>().context("parsing tx bytes")?;
    }
    Ok(bytes)
}

pub fn parse_status_uid(text: &str) -> Result<u32> {
    let line = text
        .lines()
        .find(|l| l.starts_with("Uid:"))
        .ok_or_else(|| anyhow!("missing Uid line"))?;
    line.split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("malformed Uid line"))?
        .parse()
        .context("parsing uid")
}

pub fn count_tcp_rows(text: &str, uid: u32) -> u32 {
    text.lines()
        .skip(1)
        .filter(|l| {
            l.split_whitespace()
                .nth(7)
                .and_then(|u| u.parse::<u32>().ok())
                == Some(uid)
        })
        .count() as u32
}
