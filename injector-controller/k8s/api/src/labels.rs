use std::{collections::BTreeMap, sync::Arc};

/// A shared, immutable label map.
#[derive(Clone, Debug, Default, Eq)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

// === impl Labels ===

impl Labels {
    /// True iff every `(key, value)` pair in `selector` is present in these
    /// labels. An empty selector matches everything.
    pub fn contains_all(&self, selector: &Map) -> bool {
        selector.iter().all(|(k, v)| self.0.get(k) == Some(v))
    }
}

impl AsRef<Map> for Labels {
    fn as_ref(&self) -> &Map {
        &self.0
    }
}

impl From<Map> for Labels {
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<&Map>> for Labels {
    fn from(labels: Option<&Map>) -> Self {
        labels.cloned().map(Labels::from).unwrap_or_default()
    }
}

impl<T: AsRef<Map>> PartialEq<T> for Labels {
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
