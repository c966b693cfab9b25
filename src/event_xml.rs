use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event as XmlEvent};

/// The parts of a rendered EVTX record that become a log record.
#[derive(Clone, Debug, PartialEq)]
pub struct EvtxEvent {
    pub time: DateTime<Utc>,
    pub severity: u8,
    pub provider: String,
    pub event_id: u32,
    pub channel: String,
    pub data: Vec<(String, String)>,
    pub text: String,
}

pub fn severity_name(l: u8) -> &'static str {
    match l { 0 => "LogAlways", 1 => "Critical", 2 => "Error", 3 => "Warning", 4 => "Information", 5 => "Verbose", _ => "Other" }
}

impl EvtxEvent {
    /// Named data pairs joined as `Name: value`, or the bare event data text
    /// when the provider wrote unnamed values.
    pub fn message(&self) -> String {
        if self.data.is_empty() { return self.text.clone(); }
        self.data.iter().map(|(k, v)| if k.is_empty() { v.clone() } else { format!("{}: {}", k, v) }).collect::<Vec<_>>().join("; ")
    }
}

pub fn parse_event(xml: &str, fallback_channel: &str) -> Option<EvtxEvent> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut time: Option<DateTime<Utc>> = None;
    let mut severity: u8 = 0;
    let mut provider = String::new();
    let mut event_id: u32 = 0;
    let mut channel = String::new();
    let mut data: Vec<(String, String)> = Vec::new();
    let mut text: Vec<String> = Vec::new();
    let mut cur = String::new();
    let mut in_event_data = false;
    let mut data_name: Option<String> = None;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(e)) => {
                cur = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                system_attrs(&cur, &e, &mut time, &mut provider);
                match cur.as_str() {
                    "EventData" | "UserData" => in_event_data = true,
                    "Data" if in_event_data => {
                        data_name = Some(String::new());
                        for a in e.attributes().flatten() {
                            if a.key.as_ref() == b"Name" && let Ok(v) = a.unescape_value() { data_name = Some(v.to_string()); }
                        }
                    }
                    _ => {}
                }
            }
            Ok(XmlEvent::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                system_attrs(&name, &e, &mut time, &mut provider);
            }
            Ok(XmlEvent::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "EventData" || name == "UserData" { in_event_data = false; }
                if name == "Data" { data_name = None; }
                cur.clear();
            }
            Ok(XmlEvent::Text(t)) => {
                let v = String::from_utf8_lossy(t.as_ref()).trim().to_string();
                match cur.as_str() {
                    "Level" => severity = v.parse().unwrap_or(0),
                    "EventID" => event_id = v.parse().unwrap_or(0),
                    "Channel" => channel = v,
                    _ if in_event_data && !v.is_empty() => match data_name.take() {
                        Some(n) => data.push((n, v)),
                        None => text.push(v),
                    },
                    _ => {}
                }
            }
            Ok(XmlEvent::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
    if channel.is_empty() { channel = fallback_channel.to_string(); }
    Some(EvtxEvent { time: time?, severity, provider, event_id, channel, data, text: text.join(" ") })
}

// TimeCreated and Provider appear both self-closed and as open/close pairs.
fn system_attrs(name: &str, e: &BytesStart<'_>, time: &mut Option<DateTime<Utc>>, provider: &mut String) {
    if name != "TimeCreated" && name != "Provider" { return; }
    for a in e.attributes().flatten() {
        let Ok(v) = a.unescape_value() else { continue };
        match (name, a.key.as_ref()) {
            ("TimeCreated", b"SystemTime") => *time = parse_system_time(&v),
            ("Provider", b"Name") => *provider = v.to_string(),
            _ => {}
        }
    }
}

pub fn parse_system_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) { return Some(dt.with_timezone(&Utc)); }
    let mut alt = s.replace(' ', "T");
    if !alt.ends_with('Z') && !alt.contains('+') { alt.push('Z'); }
    DateTime::parse_from_rfc3339(&alt).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGON: &str = "<Event><System><Provider Name=\"Microsoft-Windows-Security-Auditing\"/><EventID>4625</EventID><Level>0</Level><TimeCreated SystemTime=\"2024-03-01T12:00:00.123Z\"/><Channel>Security</Channel></System><EventData><Data Name=\"TargetUserName\">bob</Data><Data Name=\"IpAddress\">10.0.0.5</Data></EventData></Event>";

    #[test]
    fn parses_system_fields_and_named_data() {
        let e = parse_event(LOGON, "Fallback").unwrap();
        assert_eq!(e.event_id, 4625);
        assert_eq!(e.channel, "Security");
        assert_eq!(e.provider, "Microsoft-Windows-Security-Auditing");
        assert_eq!(e.data[0], ("TargetUserName".to_string(), "bob".to_string()));
        assert_eq!(e.message(), "TargetUserName: bob; IpAddress: 10.0.0.5");
    }

    #[test]
    fn unnamed_data_and_channel_fallback() {
        let xml = "<Event><System><Provider Name=\"Disk\"/><EventID Qualifiers=\"0\">7</EventID><Level>2</Level><TimeCreated SystemTime=\"2024-03-01 12:00:00\"/></System><EventData><Data>\\Device\\Harddisk0</Data></EventData></Event>";
        let e = parse_event(xml, "System").unwrap();
        assert_eq!(e.channel, "System");
        assert_eq!(e.severity, 2);
        assert_eq!(severity_name(e.severity), "Error");
        assert_eq!(e.message(), "\\Device\\Harddisk0");
    }

    #[test]
    fn missing_time_is_rejected() {
        assert!(parse_event("<Event><System><EventID>1</EventID></System></Event>", "System").is_none());
    }
}
