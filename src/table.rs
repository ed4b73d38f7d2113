//! Deduplicating cross-reference tables.
//!
//! Every instruction that reads a string, calls an import, or touches a global records the address of its operand
//! into the table entry it uses. The VM loader walks these rows to patch the image, so every reference must be
//! recorded exactly once.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::slice;

use compact_str::CompactString;
use educe::Educe;

/// The maximum number of references stored in a single physical row.
pub const MAX_ROW_REFS: usize = 250;

/// A stable handle to an entry of a [`Table`] with values of type `V`.
#[derive(Educe)]
#[educe(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryId<V>(usize, #[educe(Debug(ignore))] PhantomData<fn() -> V>);
impl<V> EntryId<V> {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Key of an import entry. Two calls share an import only if all four fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImportKey {
    pub function: u32,
    pub namespace: u32,
    pub params: u8,
    pub flags: u8,
}

/// A single logical entry: one value plus every address that refers to it.
#[derive(Debug, Clone)]
pub struct TableEntry<V> {
    pub value: V,
    /// Address the value itself was emitted at, for tables whose payload lives in the image.
    pub address: Option<u32>,
    pub refs: Vec<u32>,
}
impl<V> TableEntry<V> {
    /// The physical rows of this entry, each holding at most [`MAX_ROW_REFS`] references.
    pub fn rows(&self) -> slice::Chunks<'_, u32> {
        self.refs.chunks(MAX_ROW_REFS)
    }
    /// Number of physical rows. Entries without references emit no rows.
    pub fn row_count(&self) -> usize {
        self.refs.len().div_ceil(MAX_ROW_REFS)
    }
}

/// A map from a logical value to its entry, which preserves insertion order for emission.
#[derive(Debug, Clone)]
pub struct Table<V: Ord + Clone> {
    entries: Vec<TableEntry<V>>,
    index: BTreeMap<V, usize>,
}
impl<V: Ord + Clone> Default for Table<V> {
    fn default() -> Self {
        Self::new()
    }
}
impl<V: Ord + Clone> Table<V> {
    pub fn new() -> Self {
        Self { entries: vec![], index: BTreeMap::new() }
    }
    /// Gets the entry for `value`, creating it if this is the first request.
    pub fn add(&mut self, value: V) -> EntryId<V> {
        if let Some(&i) = self.index.get(&value) {
            return EntryId(i, PhantomData);
        }
        let i = self.entries.len();
        self.index.insert(value.clone(), i);
        self.entries.push(TableEntry { value, address: None, refs: vec![] });
        EntryId(i, PhantomData)
    }
    pub fn find(&self, value: &V) -> Option<EntryId<V>> {
        self.index.get(value).map(|&i| EntryId(i, PhantomData))
    }
    pub fn get(&self, id: EntryId<V>) -> Option<&TableEntry<V>> {
        self.entries.get(id.0)
    }
    /// Records that the operand at `address` refers to entry `id`.
    pub fn add_ref(&mut self, id: EntryId<V>, address: u32) {
        if let Some(entry) = self.entries.get_mut(id.0) {
            entry.refs.push(address);
        }
    }
    /// Forgets all recorded references, keeping the entries themselves.
    pub fn clear_refs(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.refs.clear();
            entry.address = None;
        }
    }
    pub fn entries(&self) -> slice::Iter<'_, TableEntry<V>> {
        self.entries.iter()
    }
    pub fn entries_mut(&mut self) -> slice::IterMut<'_, TableEntry<V>> {
        self.entries.iter_mut()
    }
    /// Number of distinct values.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Total number of physical rows over all entries.
    pub fn row_count(&self) -> usize {
        self.entries.iter().map(TableEntry::row_count).sum()
    }
    /// Total number of references over all entries.
    pub fn ref_count(&self) -> usize {
        self.entries.iter().map(|x| x.refs.len()).sum()
    }
    /// Serialized size of every row given the per-row header size (references are 4 bytes each).
    pub fn rows_size(&self, header_size: u32) -> u32 {
        (self.row_count() as u32) * header_size + (self.ref_count() as u32) * 4
    }
}

/// The string table, keyed by the literal text.
pub type StringTable = Table<CompactString>;
/// The import table.
pub type ImportTable = Table<ImportKey>;
/// The global objects table, keyed by the object's name hash.
pub type GlobalTable = Table<u32>;
/// The debug string table, keyed by the string's hash.
pub type DebugTable = Table<u32>;

/// Identifies one of the cross-reference tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableKind {
    Strings,
    Imports,
    Globals,
    Debug,
}

/// A single reference from an instruction operand to a table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableRef {
    pub table: TableKind,
    /// Index of the entry in its table (see [`EntryId::index`]).
    pub entry: usize,
    /// Absolute address of the referring operand.
    pub address: u32,
}

/// All cross-reference tables of one script.
#[derive(Debug, Clone, Default)]
pub struct ScriptTables {
    pub strings: StringTable,
    pub imports: ImportTable,
    pub globals: GlobalTable,
    pub debug: DebugTable,
}
impl ScriptTables {
    /// Forgets every recorded reference so that the image can be laid out again from scratch.
    pub fn clear_refs(&mut self) {
        self.strings.clear_refs();
        self.imports.clear_refs();
        self.globals.clear_refs();
        self.debug.clear_refs();
    }
}

#[test]
fn test_table_dedup() {
    let mut strings = StringTable::new();
    let a = strings.add("hello".into());
    let b = strings.add("world".into());
    let c = strings.add("hello".into());
    assert_eq!(a, c);
    assert_ne!(a, b);
    assert_eq!(strings.len(), 2);
    assert_eq!(strings.find(&"world".into()), Some(b));
    assert_eq!(strings.find(&"missing".into()), None);

    let mut imports = ImportTable::new();
    let key = ImportKey { function: 1, namespace: 2, params: 0, flags: 2 };
    let x = imports.add(key);
    let y = imports.add(ImportKey { flags: 3, ..key });
    let z = imports.add(key);
    assert_eq!(x, z);
    assert_ne!(x, y);
    assert_eq!(imports.len(), 2);
}

#[test]
fn test_table_rows() {
    for (refs, expected_rows) in [(0, 0), (1, 1), (249, 1), (250, 1), (251, 2), (500, 2), (501, 3), (1000, 4)] {
        let mut table = GlobalTable::new();
        let id = table.add(0xdead);
        for i in 0..refs {
            table.add_ref(id, i as u32 * 4);
        }
        let entry = table.get(id).unwrap();
        assert_eq!(entry.row_count(), expected_rows, "{refs} refs");
        assert_eq!(entry.rows().count(), expected_rows);
        assert!(entry.rows().all(|row| row.len() <= MAX_ROW_REFS));
        assert_eq!(entry.rows().map(<[u32]>::len).sum::<usize>(), refs);
        assert_eq!(table.rows_size(8), expected_rows as u32 * 8 + refs as u32 * 4);
    }
}
