use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;

use crate::store::{EntryState, PluginEntry};

/// The listing as shown: entries sorted by name, optionally narrowed by a
/// fuzzy filter, with one selected row.
#[derive(Default)]
pub struct PluginList {
    entries: Vec<PluginEntry>,
    /// Indices into `entries`, in display order.
    visible: Vec<usize>,
    pub selected: usize,
    pub filter: String,
}

impl PluginList {
    /// Replaces the listing, keeping the selection on the same name if it
    /// is still present.
    pub fn replace(&mut self, mut entries: Vec<PluginEntry>) {
        let previous = self.selected_entry().map(|entry| entry.name.clone());

        entries.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        });
        self.entries = entries;
        self.apply_filter();

        let row = previous.and_then(|name| self.rows().position(|entry| entry.name == name));
        if let Some(row) = row {
            self.selected = row;
        }
    }

    pub fn set_filter(&mut self, filter: String) {
        self.filter = filter;
        self.selected = 0;
        self.apply_filter();
    }

    pub fn clear_filter(&mut self) {
        self.set_filter(String::new());
    }

    pub fn move_selection(&mut self, delta: isize) {
        if self.visible.is_empty() {
            self.selected = 0;
            return;
        }

        let max = self.visible.len().saturating_sub(1) as isize;
        let next = (self.selected as isize + delta).clamp(0, max);
        self.selected = next as usize;
    }

    pub fn selected_entry(&self) -> Option<&PluginEntry> {
        self.visible
            .get(self.selected)
            .and_then(|&index| self.entries.get(index))
    }

    pub fn rows(&self) -> impl Iterator<Item = &PluginEntry> {
        self.visible.iter().filter_map(|&index| self.entries.get(index))
    }

    pub fn len(&self) -> usize {
        self.visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }

    /// Counts over the whole listing, ignoring the filter.
    pub fn counts(&self) -> (usize, usize) {
        let enabled = self
            .entries
            .iter()
            .filter(|entry| entry.state == EntryState::Enabled)
            .count();
        let disabled = self
            .entries
            .iter()
            .filter(|entry| entry.state == EntryState::Disabled)
            .count();
        (enabled, disabled)
    }

    fn apply_filter(&mut self) {
        if self.filter.is_empty() {
            self.visible = (0..self.entries.len()).collect();
        } else {
            let matcher = SkimMatcherV2::default();
            let mut scored: Vec<(i64, usize)> = self
                .entries
                .iter()
                .enumerate()
                .filter_map(|(index, entry)| {
                    matcher
                        .fuzzy_match(&entry.name, &self.filter)
                        .map(|score| (score, index))
                })
                .collect();

            scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            self.visible = scored.into_iter().map(|(_, index)| index).collect();
        }

        if self.visible.is_empty() {
            self.selected = 0;
        } else if self.selected >= self.visible.len() {
            self.selected = self.visible.len() - 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NamingConvention;

    fn listing(names: &[&str]) -> Vec<PluginEntry> {
        let naming = NamingConvention::default();
        names.iter().map(|name| PluginEntry::new(name, &naming)).collect()
    }

    fn shown(list: &PluginList) -> Vec<&str> {
        list.rows().map(|entry| entry.name.as_str()).collect()
    }

    #[test]
    fn test_sorted_case_insensitively() {
        let mut list = PluginList::default();
        list.replace(listing(&["worldedit.jar", "Economy.jar", "Chat.jar.disabled"]));
        assert_eq!(
            shown(&list),
            vec!["Chat.jar.disabled", "Economy.jar", "worldedit.jar"]
        );
        assert_eq!(list.counts(), (2, 1));
    }

    #[test]
    fn test_selection_follows_name_across_refresh() {
        let mut list = PluginList::default();
        list.replace(listing(&["A.jar", "B.jar", "C.jar"]));
        list.move_selection(2);
        assert_eq!(list.selected_entry().unwrap().name, "C.jar");

        list.replace(listing(&["B.jar", "C.jar"]));
        assert_eq!(list.selected_entry().unwrap().name, "C.jar");

        list.replace(listing(&["A.jar"]));
        assert_eq!(list.selected_entry().unwrap().name, "A.jar");

        list.replace(Vec::new());
        assert!(list.selected_entry().is_none());
        list.move_selection(1);
        assert_eq!(list.selected, 0);
    }

    #[test]
    fn test_fuzzy_filter() {
        let mut list = PluginList::default();
        list.replace(listing(&["Economy.jar", "EssentialsChat.jar", "WorldEdit.jar"]));

        list.set_filter("wedit".into());
        assert_eq!(shown(&list), vec!["WorldEdit.jar"]);

        list.set_filter("zzz".into());
        assert!(list.is_empty());
        assert!(list.selected_entry().is_none());

        list.clear_filter();
        assert_eq!(list.len(), 3);
    }
}
