use std::io::Write;

/// Progress sink driven by long-running operations.
///
/// Operations report through whatever sinks are attached; the driver forwards
/// every call to all of them, so a console reporter and a test recorder can
/// observe the same run.
pub trait Progress: Send {
    fn set_title(&mut self, _title: &str) {}
    fn set_count(&mut self, _count: usize, _total: usize) {}
    fn add_item(&mut self, _item: &str) {}
    fn set_item_count(&mut self, _count: usize, _total: usize) {}
    fn item_done(&mut self, _item: &str) {}
    fn done(&mut self) {}
}

/// Fan-out over any number of attached sinks.
#[derive(Default)]
pub struct ProgressSet {
    sinks: Vec<Box<dyn Progress>>,
}

impl ProgressSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, sink: Box<dyn Progress>) {
        self.sinks.push(sink);
    }
}

impl Progress for ProgressSet {
    fn set_title(&mut self, title: &str) {
        for sink in &mut self.sinks {
            sink.set_title(title);
        }
    }

    fn set_count(&mut self, count: usize, total: usize) {
        for sink in &mut self.sinks {
            sink.set_count(count, total);
        }
    }

    fn add_item(&mut self, item: &str) {
        for sink in &mut self.sinks {
            sink.add_item(item);
        }
    }

    fn set_item_count(&mut self, count: usize, total: usize) {
        for sink in &mut self.sinks {
            sink.set_item_count(count, total);
        }
    }

    fn item_done(&mut self, item: &str) {
        for sink in &mut self.sinks {
            sink.item_done(item);
        }
    }

    fn done(&mut self) {
        for sink in &mut self.sinks {
            sink.done();
        }
    }
}

/// Discards everything. Used by batch paths and tests.
pub struct NullProgress;

impl Progress for NullProgress {}

/// Single-line console reporter.
pub struct StderrProgress {
    columns: usize,
    title: String,
    last_line: String,
}

impl StderrProgress {
    pub fn new(columns: usize) -> Self {
        Self {
            columns,
            title: String::new(),
            last_line: String::new(),
        }
    }

    fn print(&mut self, line: &str) {
        let mut line = line.to_string();
        if line.len() > self.columns {
            line.truncate(self.columns.saturating_sub(3));
            line.push_str("...");
        }
        let padding = self.last_line.len().saturating_sub(line.len());
        eprint!("\r{}{}", line, " ".repeat(padding));
        let _ = std::io::stderr().flush();
        self.last_line = line;
    }
}

impl Progress for StderrProgress {
    fn set_title(&mut self, title: &str) {
        self.title = title.to_string();
        let line = self.title.clone();
        self.print(&line);
    }

    fn set_count(&mut self, count: usize, total: usize) {
        let line = format!("{} {}/{}", self.title, count, total);
        self.print(&line);
    }

    fn add_item(&mut self, item: &str) {
        let line = format!("{} ({})", self.title, item);
        self.print(&line);
    }

    fn set_item_count(&mut self, _count: usize, _total: usize) {}

    fn item_done(&mut self, _item: &str) {}

    fn done(&mut self) {
        eprintln!();
    }
}
