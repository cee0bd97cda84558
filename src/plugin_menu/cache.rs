// plugin_menu/cache.rs
//
// 图片查找缓存：目录扫描 -> 名称到路径的快照映射。
// 快照整体替换、整体失效，读取方不会看到两次扫描混合的结果。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// 识别为图片的扩展名（小写比较）
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// 一次扫描得到的完整映射：显示名（去扩展名的文件名）-> 完整路径
pub type Snapshot = Arc<HashMap<String, PathBuf>>;

/// 缓存层错误
/// 调用方负责决定如何呈现（记日志 / 回复用户），缓存本身不打日志
#[derive(Debug)]
pub enum CacheError {
    /// 菜单目录不存在或不是目录
    DirMissing(PathBuf),
    /// 扫描过程中的 IO 错误
    Io(std::io::Error),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::DirMissing(p) => write!(f, "菜单目录不存在: {}", p.display()),
            CacheError::Io(e) => write!(f, "扫描菜单目录失败: {}", e),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io(e)
    }
}

/// 菜单统计信息（展示用，按需计算，不缓存）
#[derive(Debug)]
pub struct MenuStats {
    /// 缓存中的条目总数（含已失踪的）
    pub total: usize,
    /// 各扩展名的数量分布（小写，按字典序）
    pub by_extension: BTreeMap<String, usize>,
    /// 现存文件的字节总数（失踪文件不计入）
    pub total_bytes: u64,
    /// 缓存中存在但磁盘上已不存在的名称
    pub missing: Vec<String>,
}

impl MenuStats {
    /// 现存文件的平均字节数
    pub fn average_bytes(&self) -> u64 {
        let existing = self.total - self.missing.len();
        if existing == 0 {
            0
        } else {
            self.total_bytes / existing as u64
        }
    }
}

struct CacheState {
    entries: Option<Snapshot>,
    refreshed_at: Option<Instant>,
}

/// 图片查找缓存
///
/// 惰性 TTL 刷新：`get_cached` 在快照过期时同步重扫目录；
/// `invalidate` 整体清空，下一次读取必定重扫一次。
/// 扫描失败不会写入快照，下一次读取会重试。
pub struct MenuCache {
    dir: PathBuf,
    ttl: Duration,
    fuzzy: bool,
    state: Mutex<CacheState>,
    scan_count: AtomicU64,
}

impl MenuCache {
    pub fn new<P: AsRef<Path>>(dir: P, ttl: Duration, fuzzy: bool) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ttl,
            fuzzy,
            state: Mutex::new(CacheState {
                entries: None,
                refreshed_at: None,
            }),
            scan_count: AtomicU64::new(0),
        }
    }

    /// 菜单目录路径
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 累计扫描次数
    pub fn scan_count(&self) -> u64 {
        self.scan_count.load(Ordering::SeqCst)
    }

    /// 当前快照的条目数，不触发扫描（无快照时为 0）
    pub fn cached_len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.entries.as_ref().map(|e| e.len()).unwrap_or(0)
    }

    /// 全量扫描目录，构建新映射
    ///
    /// 只收录扩展名在允许列表中的普通文件；同名（不同扩展名）后扫描到的覆盖先扫描到的。
    fn scan_directory(&self) -> Result<HashMap<String, PathBuf>, CacheError> {
        if !self.dir.is_dir() {
            return Err(CacheError::DirMissing(self.dir.clone()));
        }

        let mut map = HashMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
                continue;
            }

            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                map.insert(stem.to_string(), path);
            }
        }

        self.scan_count.fetch_add(1, Ordering::SeqCst);
        Ok(map)
    }

    /// 获取当前快照，过期或无快照时同步重扫
    pub fn get_cached(&self) -> Result<Snapshot, CacheError> {
        let mut state = self.state.lock().unwrap();

        if let (Some(entries), Some(at)) = (&state.entries, state.refreshed_at)
            && at.elapsed() < self.ttl
        {
            return Ok(entries.clone());
        }

        let fresh: Snapshot = Arc::new(self.scan_directory()?);
        state.entries = Some(fresh.clone());
        state.refreshed_at = Some(Instant::now());
        Ok(fresh)
    }

    /// 整体失效：清空映射与时间戳
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap();
        state.entries = None;
        state.refreshed_at = None;
    }

    /// 强制刷新，返回 (刷新前条目数, 刷新后条目数)
    pub fn refresh(&self) -> Result<(usize, usize), CacheError> {
        let before = self.cached_len();
        self.invalidate();
        let after = self.get_cached()?.len();
        Ok((before, after))
    }

    /// 按名称查找图片路径
    ///
    /// 先去除首尾空白，再与缓存键做精确匹配。
    /// 开启 fuzzy 时追加忽略大小写的子串匹配，多个候选取最短名称（同长取字典序）。
    pub fn find_by_name(&self, name: &str) -> Result<Option<PathBuf>, CacheError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let snapshot = self.get_cached()?;
        if let Some(path) = snapshot.get(trimmed) {
            return Ok(Some(path.clone()));
        }

        if self.fuzzy {
            let needle = trimmed.to_lowercase();
            let best = snapshot
                .iter()
                .filter(|(k, _)| k.to_lowercase().contains(&needle))
                .min_by(|(a, _), (b, _)| a.chars().count().cmp(&b.chars().count()).then(a.cmp(b)));
            if let Some((_, path)) = best {
                return Ok(Some(path.clone()));
            }
        }

        Ok(None)
    }

    /// 当前快照中所有名称，按字典序排列
    pub fn list_names(&self) -> Result<Vec<String>, CacheError> {
        let snapshot = self.get_cached()?;
        let mut names: Vec<String> = snapshot.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// 统计当前快照：数量、扩展名分布、字节数、失踪文件
    ///
    /// 逐文件 stat，失踪文件记入 missing 且不计入字节总数，但仍计入总条目数。
    pub fn stats(&self) -> Result<MenuStats, CacheError> {
        let snapshot = self.get_cached()?;

        let mut by_extension: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_bytes = 0u64;
        let mut missing = Vec::new();

        for (name, path) in snapshot.iter() {
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                *by_extension.entry(ext.to_ascii_lowercase()).or_insert(0) += 1;
            }

            match fs::metadata(path) {
                Ok(meta) => total_bytes += meta.len(),
                Err(_) => missing.push(name.clone()),
            }
        }
        missing.sort();

        Ok(MenuStats {
            total: snapshot.len(),
            by_extension,
            total_bytes,
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LONG_TTL: Duration = Duration::from_secs(300);

    fn menu_dir(files: &[(&str, &[u8])]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, bytes) in files {
            fs::write(dir.path().join(name), bytes).unwrap();
        }
        dir
    }

    #[test]
    fn scan_maps_base_names_to_paths() {
        let dir = menu_dir(&[("早餐.png", b"x"), ("午餐.jpg", b"y")]);
        let cache = MenuCache::new(dir.path(), LONG_TTL, false);

        let snapshot = cache.get_cached().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.get("早餐"),
            Some(&dir.path().join("早餐.png"))
        );
        assert_eq!(
            snapshot.get("午餐"),
            Some(&dir.path().join("午餐.jpg"))
        );
    }

    #[test]
    fn extension_filter_is_case_insensitive() {
        let dir = menu_dir(&[("A.png", b"x"), ("b.JPG", b"y"), ("skip.txt", b"z")]);
        let cache = MenuCache::new(dir.path(), LONG_TTL, false);

        let snapshot = cache.get_cached().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key("A"));
        assert!(snapshot.contains_key("b"));
        assert!(!snapshot.contains_key("skip"));
    }

    #[test]
    fn within_ttl_reuses_snapshot_without_rescan() {
        let dir = menu_dir(&[("A.png", b"x")]);
        let cache = MenuCache::new(dir.path(), LONG_TTL, false);

        let first = cache.get_cached().unwrap();
        let second = cache.get_cached().unwrap();

        assert_eq!(cache.scan_count(), 1);
        // TTL 内返回的是同一个快照对象
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn expired_ttl_triggers_rescan() {
        let dir = menu_dir(&[("A.png", b"x")]);
        let cache = MenuCache::new(dir.path(), Duration::ZERO, false);

        cache.get_cached().unwrap();
        cache.get_cached().unwrap();
        assert_eq!(cache.scan_count(), 2);
    }

    #[test]
    fn invalidate_forces_exactly_one_rescan() {
        let dir = menu_dir(&[("A.png", b"x")]);
        let cache = MenuCache::new(dir.path(), LONG_TTL, false);

        cache.get_cached().unwrap();
        assert_eq!(cache.scan_count(), 1);

        // TTL 远未到期，失效后下一次读取仍然必须重扫
        cache.invalidate();
        assert_eq!(cache.cached_len(), 0);

        cache.get_cached().unwrap();
        assert_eq!(cache.scan_count(), 2);

        // 再次读取回到 TTL 命中路径
        cache.get_cached().unwrap();
        assert_eq!(cache.scan_count(), 2);
    }

    #[test]
    fn find_trims_and_matches_exactly() {
        let dir = menu_dir(&[("Alpha.png", b"x"), ("Alpha2.png", b"y")]);
        let cache = MenuCache::new(dir.path(), LONG_TTL, false);

        let found = cache.find_by_name("  Alpha  ").unwrap();
        assert_eq!(found, Some(dir.path().join("Alpha.png")));

        // 精确匹配不做子串联想
        assert_eq!(cache.find_by_name("Alph").unwrap(), None);
        assert_eq!(cache.find_by_name("alpha").unwrap(), None);
        assert_eq!(cache.find_by_name("   ").unwrap(), None);
    }

    #[test]
    fn fuzzy_match_is_opt_in() {
        let dir = menu_dir(&[("红烧肉套餐.png", b"x"), ("红烧鱼.png", b"y")]);
        let cache = MenuCache::new(dir.path(), LONG_TTL, true);

        // 子串命中，多个候选取最短名称
        let found = cache.find_by_name("红烧").unwrap();
        assert_eq!(found, Some(dir.path().join("红烧鱼.png")));

        // 精确命中优先于模糊
        let exact = cache.find_by_name("红烧肉套餐").unwrap();
        assert_eq!(exact, Some(dir.path().join("红烧肉套餐.png")));
    }

    #[test]
    fn missing_dir_yields_error_and_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("不存在");
        let cache = MenuCache::new(&gone, LONG_TTL, false);

        assert!(matches!(
            cache.get_cached(),
            Err(CacheError::DirMissing(_))
        ));
        assert_eq!(cache.cached_len(), 0);

        // 目录出现后下一次读取即可成功（失败不会固化为空快照）
        fs::create_dir_all(&gone).unwrap();
        fs::write(gone.join("A.png"), b"x").unwrap();
        let snapshot = cache.get_cached().unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn stats_detects_vanished_files() {
        let dir = menu_dir(&[("X.png", b"1234"), ("Y.jpg", b"12")]);
        let cache = MenuCache::new(dir.path(), LONG_TTL, false);
        cache.get_cached().unwrap();

        // 扫描之后文件被删除
        fs::remove_file(dir.path().join("X.png")).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.missing, vec!["X".to_string()]);
        // 失踪文件不计入字节数
        assert_eq!(stats.total_bytes, 2);
        assert_eq!(stats.average_bytes(), 2);
        assert_eq!(stats.by_extension.get("png"), Some(&1));
        assert_eq!(stats.by_extension.get("jpg"), Some(&1));
    }

    #[test]
    fn refresh_reports_before_and_after_counts() {
        let dir = menu_dir(&[("A.png", b"x")]);
        let cache = MenuCache::new(dir.path(), LONG_TTL, false);
        cache.get_cached().unwrap();

        fs::write(dir.path().join("B.png"), b"y").unwrap();
        let (before, after) = cache.refresh().unwrap();
        assert_eq!((before, after), (1, 2));
        assert_eq!(cache.scan_count(), 2);
    }

    #[test]
    fn periodic_invalidation_between_lookups_rescans_once() {
        let dir = menu_dir(&[("A.png", b"x")]);
        let cache = Arc::new(MenuCache::new(dir.path(), LONG_TTL, false));

        cache.get_cached().unwrap();
        assert_eq!(cache.scan_count(), 1);

        // 模拟后台定时任务在两次查找之间触发失效
        let bg = cache.clone();
        bg.invalidate();

        cache.find_by_name("A").unwrap();
        assert_eq!(cache.scan_count(), 2);

        cache.find_by_name("A").unwrap();
        assert_eq!(cache.scan_count(), 2);
    }

    #[test]
    fn list_names_is_sorted() {
        let dir = menu_dir(&[("b.png", b"x"), ("a.png", b"y"), ("c.gif", b"z")]);
        let cache = MenuCache::new(dir.path(), LONG_TTL, false);

        let names = cache.list_names().unwrap();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
