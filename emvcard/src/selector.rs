use crate::apdu::{Apdu, StatusWord};
use crate::error::EmvError;
use crate::event::CardEvent;
use crate::tlv;
use crate::EmvConnection;
use log::{debug, info, warn};
use serde::Serialize;

pub const CONTACT_DIRECTORY_NAME: &str = "1PAY.SYS.DDF01";
pub const CONTACTLESS_DIRECTORY_NAME: &str = "2PAY.SYS.DDF01";

const DIRECTORY_SFI: u8 = 1;
const DIRECTORY_LAST_RECORD: u8 = 31;

const TAG_AID: u32 = 0x4F;
const TAG_APPLICATION_LABEL: u32 = 0x50;
const TAG_APPLICATION_PRIORITY: u32 = 0x87;
const TAG_APPLICATION_PREFERRED_NAME: u32 = 0x9F12;
const TAG_APPLICATION_TEMPLATE: u32 = 0x61;
const TAG_RECORD_TEMPLATE: u32 = 0x70;
const TAG_FCI_TEMPLATE: u32 = 0x6F;
const TAG_FCI_PROPRIETARY_TEMPLATE: u32 = 0xA5;
const TAG_FCI_ISSUER_DISCRETIONARY_DATA: u32 = 0xBF0C;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplicationInfo {
    #[serde(with = "hex::serde")]
    pub aid: Vec<u8>,
    pub label: String,
    pub preferred_name: Option<String>,
    /// Application Priority Indicator, 0 when the card did not provide one.
    pub priority: u8,
}

impl ApplicationInfo {
    pub fn display_name(&self) -> String {
        if !self.label.is_empty() {
            return self.label.clone();
        }

        let aid = hex::encode_upper(&self.aid);
        format!("App_{}", &aid[aid.len().saturating_sub(4)..])
    }

    /// Priority order per EMV Book 1, 12.2.3: lower nibble 1 is the highest,
    /// 0 means no priority and sorts last.
    fn priority_rank(&self) -> u8 {
        match self.priority & 0x0F {
            0 => 0x10,
            rank => rank,
        }
    }
}

/// Highest priority application, the first listed one on ties.
pub fn preferred_application(applications: &[ApplicationInfo]) -> Option<&ApplicationInfo> {
    applications
        .iter()
        .enumerate()
        .min_by_key(|(i, application)| (application.priority_rank(), *i))
        .map(|(_, application)| application)
}

fn label_text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).trim().to_string()
}

impl EmvConnection<'_> {
    fn select(&mut self, name: &[u8]) -> Result<Vec<u8>, EmvError> {
        self.exchange_with_autofix(&Apdu::select(name))?
            .into_success_data()
    }

    /// SELECT by AID. The FCI is handed back for processing options negotiation.
    pub fn select_application(&mut self, aid: &[u8]) -> Result<Vec<u8>, EmvError> {
        info!("Selecting application. AID:{:02X?}", aid);

        self.select(aid).map_err(|err| {
            warn!("Could not select payment application! {:02X?}: {}", aid, err);
            err
        })
    }

    /// Payment System Environment: directory records of SFI 1.
    pub fn load_contact_directory(&mut self) -> Result<Vec<ApplicationInfo>, EmvError> {
        debug!("Selecting Payment System Environment (PSE):");
        self.select(CONTACT_DIRECTORY_NAME.as_bytes())?;

        let mut applications: Vec<ApplicationInfo> = Vec::new();

        for record_index in 1..=DIRECTORY_LAST_RECORD {
            let response =
                self.exchange_with_autofix(&Apdu::read_record(DIRECTORY_SFI, record_index))?;

            if response.status == StatusWord::RECORD_NOT_FOUND {
                debug!("Record {} does not exist, ending AID reading", record_index);
                break;
            }

            if !response.is_success() {
                debug!("Record {} read failed ({}), stopping", record_index, response.status);
                break;
            }

            self.parse_directory_record(&response.data, &mut applications);
        }

        info!("Found {} applications", applications.len());

        Ok(applications)
    }

    /// Proximity Payment System Environment: the FCI itself lists the
    /// application templates.
    pub fn load_contactless_directory(&mut self) -> Result<Vec<ApplicationInfo>, EmvError> {
        debug!("Selecting Proximity Payment System Environment (PPSE):");
        let fci = self.select(CONTACTLESS_DIRECTORY_NAME.as_bytes())?;

        let mut applications: Vec<ApplicationInfo> = Vec::new();
        self.walk_proximity_fci(&fci, &mut applications);

        info!("Found {} applications", applications.len());

        Ok(applications)
    }

    // 6F > A5 > BF0C > 61
    fn walk_proximity_fci(&self, buffer: &[u8], applications: &mut Vec<ApplicationInfo>) {
        let mut index = 0;

        while index < buffer.len() {
            let (node, next) = match tlv::read_node(buffer, index, buffer.len()) {
                Ok(result) => result,
                Err(reason) => {
                    self.emit(CardEvent::ParseStopped(reason));
                    break;
                }
            };
            index = next;

            match node.tag {
                TAG_FCI_TEMPLATE
                | TAG_FCI_PROPRIETARY_TEMPLATE
                | TAG_FCI_ISSUER_DISCRETIONARY_DATA => {
                    self.walk_proximity_fci(&node.value, applications)
                }
                TAG_APPLICATION_TEMPLATE => {
                    if let Some(application) = self.parse_application_template(&node.value) {
                        applications.push(application);
                    }
                }
                _ => {}
            }
        }
    }

    // 4F sets the current AID, 50 creates the entry once per AID
    fn parse_directory_record(&self, buffer: &[u8], applications: &mut Vec<ApplicationInfo>) {
        let mut current_aid: Vec<u8> = Vec::new();
        self.walk_directory_tlv(buffer, &mut current_aid, applications);
    }

    fn walk_directory_tlv(
        &self,
        buffer: &[u8],
        current_aid: &mut Vec<u8>,
        applications: &mut Vec<ApplicationInfo>,
    ) {
        let mut index = 0;

        while index < buffer.len() {
            let (node, next) = match tlv::read_node(buffer, index, buffer.len()) {
                Ok(result) => result,
                Err(reason) => {
                    self.emit(CardEvent::ParseStopped(reason));
                    break;
                }
            };
            index = next;

            match node.tag {
                TAG_AID => *current_aid = node.value,
                TAG_APPLICATION_LABEL => {
                    if !applications.iter().any(|a| a.aid == *current_aid) {
                        let label = label_text(&node.value);
                        self.emit(CardEvent::ApplicationFound {
                            aid: current_aid.clone(),
                            label: label.clone(),
                        });
                        applications.push(ApplicationInfo {
                            aid: current_aid.clone(),
                            label,
                            ..ApplicationInfo::default()
                        });
                    }
                }
                TAG_APPLICATION_PRIORITY => {
                    if let (Some(application), Some(priority)) = (
                        applications.iter_mut().find(|a| a.aid == *current_aid),
                        node.value.first(),
                    ) {
                        application.priority = *priority;
                    }
                }
                TAG_APPLICATION_PREFERRED_NAME => {
                    if let Some(application) =
                        applications.iter_mut().find(|a| a.aid == *current_aid)
                    {
                        application.preferred_name = Some(label_text(&node.value));
                    }
                }
                TAG_APPLICATION_TEMPLATE | TAG_RECORD_TEMPLATE => {
                    self.walk_directory_tlv(&node.value, current_aid, applications)
                }
                _ => {}
            }
        }
    }

    fn parse_application_template(&self, template: &[u8]) -> Option<ApplicationInfo> {
        let mut application = ApplicationInfo::default();
        let mut index = 0;

        while index < template.len() {
            let (node, next) = match tlv::read_node(template, index, template.len()) {
                Ok(result) => result,
                Err(reason) => {
                    self.emit(CardEvent::ParseStopped(reason));
                    break;
                }
            };
            index = next;

            match node.tag {
                TAG_AID => application.aid = node.value,
                TAG_APPLICATION_LABEL => application.label = label_text(&node.value),
                TAG_APPLICATION_PRIORITY => {
                    application.priority = node.value.first().copied().unwrap_or(0)
                }
                TAG_APPLICATION_PREFERRED_NAME => {
                    application.preferred_name = Some(label_text(&node.value))
                }
                _ => {}
            }
        }

        if application.aid.is_empty() {
            return None;
        }

        self.emit(CardEvent::ApplicationFound {
            aid: application.aid.clone(),
            label: application.label.clone(),
        });

        Some(application)
    }
}
