//! Minimal gemtext emitter used for generated pages such as directory
//! listings. Line prefixes follow text/gemini: `#` headings, `=>` links,
//! `*` list items, `>` quotes and ``` toggles.

#[derive(Debug, Default)]
pub struct GemtextBuilder {
    out: String,
    preformatted: bool,
}

impl GemtextBuilder {
    pub fn new() -> GemtextBuilder {
        GemtextBuilder::default()
    }

    pub fn heading(&mut self, level: u8, text: &str) -> &mut Self {
        let level = level.clamp(1, 3) as usize;
        self.out.push_str(&"#".repeat(level));
        self.out.push(' ');
        self.push_line(text);
        self
    }

    /// `=> url [description]`. The URL must already be percent-encoded;
    /// it is the first whitespace-separated token on the line.
    pub fn link(&mut self, url: &str, description: Option<&str>) -> &mut Self {
        self.out.push_str("=> ");
        self.out.push_str(url);
        if let Some(description) = description {
            self.out.push(' ');
            self.out.push_str(description);
        }
        self.out.push('\n');
        self
    }

    pub fn list_item(&mut self, text: &str) -> &mut Self {
        self.out.push_str("* ");
        self.push_line(text);
        self
    }

    pub fn quote(&mut self, text: &str) -> &mut Self {
        self.out.push_str("> ");
        self.push_line(text);
        self
    }

    pub fn text(&mut self, line: &str) -> &mut Self {
        self.push_line(line);
        self
    }

    pub fn blank(&mut self) -> &mut Self {
        self.out.push('\n');
        self
    }

    /// Toggle a preformatted block. The alt text only applies on the
    /// opening fence.
    pub fn preformat(&mut self, alt: Option<&str>) -> &mut Self {
        self.out.push_str("```");
        if let Some(alt) = alt.filter(|_| !self.preformatted) {
            self.out.push_str(alt);
        }
        self.out.push('\n');
        self.preformatted = !self.preformatted;
        self
    }

    pub fn finish(mut self) -> String {
        if self.preformatted {
            self.out.push_str("```\n");
        }
        self.out
    }

    fn push_line(&mut self, text: &str) {
        // a stray newline would change the meaning of the next line
        let line = text.split(['\r', '\n']).next().unwrap_or("");
        self.out.push_str(line);
        self.out.push('\n');
    }
}
