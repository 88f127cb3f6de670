use crate::table::Record;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Track {
	pub id: u32,
	pub name: String,
}

pub(crate) fn track(id: u32, name: &str) -> Track {
	Track { id, name: name.to_owned() }
}

impl Record for Track {
	type Key = u32;

	fn key(&self) -> u32 {
		self.id
	}

	fn index(&self, field: &str) -> Option<&str> {
		(field == "name").then_some(self.name.as_str())
	}
}
